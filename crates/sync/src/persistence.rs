//! Persistent store adapter: queue and offline-action log as JSON envelopes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use offsync_infra::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::types::{OfflineActionRecord, SyncQueueItem};

pub const DEFAULT_QUEUE_KEY: &str = "offsync:queue";
pub const DEFAULT_ACTIONS_KEY: &str = "offsync:offline-actions";
pub const CACHE_KEY_PREFIX: &str = "offsync:cache:";

const FORMAT_VERSION: u32 = 1;

/// On-disk wrapper around a list of entries.
#[derive(Debug, Serialize, Deserialize)]
struct Persisted<T> {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<T>,
}

/// Reads and writes sync state through a [`KeyValueStore`].
#[derive(Clone)]
pub struct QueueStore {
    kv: Arc<dyn KeyValueStore>,
    queue_key: String,
    actions_key: String,
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("queue_key", &self.queue_key)
            .field("actions_key", &self.actions_key)
            .finish_non_exhaustive()
    }
}

impl QueueStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_keys(kv, DEFAULT_QUEUE_KEY, DEFAULT_ACTIONS_KEY)
    }

    pub fn with_keys(
        kv: Arc<dyn KeyValueStore>,
        queue_key: impl Into<String>,
        actions_key: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            queue_key: queue_key.into(),
            actions_key: actions_key.into(),
        }
    }

    pub async fn load_queue(&self) -> Result<Vec<SyncQueueItem>, PersistenceError> {
        self.load_entries(&self.queue_key).await
    }

    pub async fn save_queue(
        &self,
        items: &[SyncQueueItem],
        now: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.save_entries(&self.queue_key, items, now).await
    }

    pub async fn load_actions(&self) -> Result<Vec<OfflineActionRecord>, PersistenceError> {
        self.load_entries(&self.actions_key).await
    }

    pub async fn save_actions(
        &self,
        records: &[OfflineActionRecord],
        now: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.save_entries(&self.actions_key, records, now).await
    }

    /// Store a response body under `key` verbatim.
    pub async fn save_cache(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.kv.save(key, bytes).await?;
        Ok(())
    }

    async fn load_entries<T>(&self, key: &str) -> Result<Vec<T>, PersistenceError>
    where
        T: DeserializeOwned,
    {
        let Some(bytes) = self.kv.load(key).await? else {
            return Ok(Vec::new());
        };
        if bytes.is_empty() {
            return Ok(Vec::new());
        }

        let envelope: Persisted<T> = serde_json::from_slice(&bytes)?;
        if envelope.version != FORMAT_VERSION {
            return Err(PersistenceError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope.entries)
    }

    async fn save_entries<T>(
        &self,
        key: &str,
        entries: &[T],
        now: DateTime<Utc>,
    ) -> Result<(), PersistenceError>
    where
        T: Serialize + Clone,
    {
        let envelope = Persisted {
            version: FORMAT_VERSION,
            saved_at: now,
            entries: entries.to_vec(),
        };
        let bytes = serde_json::to_vec(&envelope)?;
        self.kv.save(key, &bytes).await?;
        tracing::debug!(key, entries = entries.len(), "persisted sync state");
        Ok(())
    }
}
