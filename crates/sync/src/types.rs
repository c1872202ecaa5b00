//! Queue data model shared by every component of the sync subsystem.

use chrono::{DateTime, Utc};
use offsync_core::{ActionId, ItemId};
use offsync_infra::HttpMethod;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category of deferred work.
///
/// Only used to pick the success handler; never affects ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncKind {
    ChartCalculation,
    UserDataUpdate,
    SessionSave,
    NotificationDelivery,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::ChartCalculation => "chart-calculation",
            SyncKind::UserDataUpdate => "user-data-update",
            SyncKind::SessionSave => "session-save",
            SyncKind::NotificationDelivery => "notification-delivery",
        }
    }
}

impl core::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority. Declaration order is the sort order (`Low < Normal < High`).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Destination of a queued write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub method: HttpMethod,
    /// Path relative to the configured API base URL, or an absolute URL.
    pub endpoint: String,
}

impl SyncTarget {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
        }
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, endpoint)
    }

    pub fn patch(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Patch, endpoint)
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: ItemId,
    pub kind: SyncKind,
    pub payload: Value,
    pub target: SyncTarget,
    pub priority: Priority,
    pub max_attempts: u32,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    /// Admission order within the queue; last ordering tie-breaker.
    pub sequence: u64,
    /// Offline action this write was captured from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_action: Option<ActionId>,
}

impl SyncQueueItem {
    /// Whether the item may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at <= now
    }
}

/// Caller input to `enqueue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub kind: SyncKind,
    #[serde(default)]
    pub payload: Value,
    pub target: SyncTarget,
    #[serde(default)]
    pub priority: Priority,
    /// Retry budget; `None` uses the configured default. Zero is raised to one.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub offline_action: Option<ActionId>,
}

impl EnqueueRequest {
    pub fn new(kind: SyncKind, payload: Value, target: SyncTarget) -> Self {
        Self {
            kind,
            payload,
            target,
            priority: Priority::Normal,
            max_attempts: None,
            offline_action: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Mark the correlated offline action synced once this item is delivered.
    pub fn correlated_with(mut self, action: ActionId) -> Self {
        self.offline_action = Some(action);
        self
    }
}

/// A user action captured while disconnected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineActionRecord {
    pub id: ActionId,
    pub kind: SyncKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub synced: bool,
}

/// An item dropped after exhausting its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermanentFailureRecord {
    pub item: SyncQueueItem,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub online: bool,
    pub running: bool,
    pub queued_count: usize,
    pub unsynced_offline_action_count: usize,
    pub permanent_failure_count_since_clear: u64,
}
