//! Durable key-value storage for queue state.
//!
//! The sync queue persists two opaque blobs (the serialized queue and the
//! serialized offline-action log) plus optional local caches. The contract is
//! deliberately tiny so any durable backend (SQLite, a file, a platform
//! key-value store) can sit behind it:
//!
//! - `load(key)` returns `None` when the key was never written
//! - `save(key, bytes)` overwrites (last writer wins)

use async_trait::async_trait;
use std::sync::Arc;

pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryKvStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteKvStore;

/// Key-value store failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable key-value store abstraction.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn save(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> KeyValueStore for Arc<S>
where
    S: KeyValueStore + ?Sized,
{
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).load(key).await
    }

    async fn save(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        (**self).save(key, value).await
    }
}
