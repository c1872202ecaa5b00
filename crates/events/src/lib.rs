//! Cross-process broadcast of sync outcomes.
//!
//! Other processes sharing the same origin (windows, tabs, sibling agents) learn
//! about completed deliveries through a [`Broadcaster`]. Delivery is best-effort.

pub mod bus;
pub mod in_memory_bus;
pub mod message;

pub use bus::{BroadcastError, Broadcaster, Subscription};
pub use in_memory_bus::InMemoryBroadcaster;
pub use message::BroadcastMessage;
