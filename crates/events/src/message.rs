use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message published to sibling processes.
///
/// `topic` names the outcome (`user-data-updated`, `session-saved`, ...);
/// `payload` carries whatever the receiving side needs to refresh its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub topic: String,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

impl BroadcastMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            published_at: Utc::now(),
        }
    }
}
