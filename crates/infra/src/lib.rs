//! Infrastructure adapters for the sync subsystem.
//!
//! Each collaborator the queue consumes is defined here as a small trait plus
//! at least one in-memory implementation for tests/dev:
//!
//! - [`kv`]: durable key-value store (in-memory, SQLite)
//! - [`transport`]: one-shot request transport (HTTP via `reqwest`)
//! - [`notify`]: user-visible notification sink

pub mod kv;
pub mod notify;
pub mod transport;

pub use kv::{InMemoryKvStore, KeyValueStore, StoreError};
pub use notify::{InMemoryNotifier, Notification, Notifier, TracingNotifier, Urgency};
pub use transport::{HttpMethod, Transport, TransportError, TransportRequest, TransportResponse};

#[cfg(feature = "sqlite")]
pub use kv::SqliteKvStore;
#[cfg(feature = "http")]
pub use transport::HttpTransport;
