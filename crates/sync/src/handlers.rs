//! Kind-specific success handling.
//!
//! [`plan_success`] decides what a delivered item causes; the coordinator
//! applies the plan. Caller hooks run after the built-in effects.

use std::collections::HashMap;
use std::sync::Arc;

use offsync_events::BroadcastMessage;
use serde_json::json;

use crate::executor::ResponseBody;
use crate::persistence::CACHE_KEY_PREFIX;
use crate::types::{SyncKind, SyncQueueItem};

pub const TOPIC_USER_DATA_UPDATED: &str = "user-data-updated";
pub const TOPIC_CHART_CALCULATED: &str = "chart-calculated";
pub const TOPIC_SESSION_SAVED: &str = "session-saved";

/// A response body to store in the local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWrite {
    pub key: String,
    pub bytes: Vec<u8>,
}

/// Side effects of one successful delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct SuccessEffects {
    pub mark_action_synced: Option<offsync_core::ActionId>,
    pub broadcast: Option<BroadcastMessage>,
    pub cache_write: Option<CacheWrite>,
}

/// Local cache key for responses from `endpoint`.
pub fn cache_key(endpoint: &str) -> String {
    format!("{CACHE_KEY_PREFIX}{endpoint}")
}

pub fn plan_success(item: &SyncQueueItem, body: &ResponseBody) -> SuccessEffects {
    let announce = |topic: &str| {
        BroadcastMessage::new(
            topic,
            json!({
                "item_id": item.id,
                "kind": item.kind,
                "endpoint": item.target.endpoint,
            }),
        )
    };

    let (broadcast, cache_write) = match item.kind {
        SyncKind::UserDataUpdate => (Some(announce(TOPIC_USER_DATA_UPDATED)), None),
        SyncKind::ChartCalculation => (
            Some(announce(TOPIC_CHART_CALCULATED)),
            Some(CacheWrite {
                key: cache_key(&item.target.endpoint),
                bytes: body.bytes.clone(),
            }),
        ),
        SyncKind::SessionSave => (Some(announce(TOPIC_SESSION_SAVED)), None),
        SyncKind::NotificationDelivery => (None, None),
    };

    SuccessEffects {
        mark_action_synced: item.offline_action,
        broadcast,
        cache_write,
    }
}

/// Caller callback run after an item of its kind is delivered. Must not block.
pub type SuccessHook = Arc<dyn Fn(&SyncQueueItem, &ResponseBody) + Send + Sync>;

/// Registered caller hooks, one per kind.
#[derive(Default, Clone)]
pub struct SuccessHooks {
    hooks: HashMap<SyncKind, SuccessHook>,
}

impl std::fmt::Debug for SuccessHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuccessHooks")
            .field("kinds", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SuccessHooks {
    /// Register `hook` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: SyncKind, hook: SuccessHook) {
        self.hooks.insert(kind, hook);
    }

    pub fn get(&self, kind: SyncKind) -> Option<SuccessHook> {
        self.hooks.get(&kind).cloned()
    }
}
