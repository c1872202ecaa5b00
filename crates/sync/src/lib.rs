//! `offsync-sync`: durable background delivery of offline writes.
//!
//! Callers enqueue writes; the [`SyncCoordinator`] persists them and delivers
//! them in priority/age order whenever the client is online, retrying with
//! exponential backoff until success or until the item's budget runs out.
//!
//! Delivery is at-least-once. Receivers of broadcasts and success hooks must
//! tolerate duplicates.

pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod offline;
pub mod persistence;
pub mod queue;
pub mod types;

pub use backoff::{BackoffPolicy, delay_for};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::{Collaborators, PassReport, SyncCoordinator, SyncHandle};
pub use error::{DeliveryFailure, PersistenceError, SyncError};
pub use executor::{DeliveryExecutor, DeliveryOutcome, ResponseBody, TokenAccessor};
pub use handlers::{SuccessHook, cache_key};
pub use offline::ConnectivityEvent;
pub use persistence::QueueStore;
pub use queue::{FailureDisposition, SyncQueue};
pub use types::{
    EnqueueRequest, OfflineActionRecord, PermanentFailureRecord, Priority, SyncKind,
    SyncQueueItem, SyncStatus, SyncTarget,
};
