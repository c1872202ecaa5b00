//! `offsync-core`: shared building blocks for the sync subsystem.
//!
//! This crate contains **pure** primitives (no IO, no async runtime).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use id::{ActionId, ItemId};
