//! Offline action log and connectivity state.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use offsync_core::ActionId;
use serde_json::Value;

use crate::types::{OfflineActionRecord, SyncKind};

/// Append log of user actions captured while disconnected.
///
/// Records are only flipped to `synced`; removal is left to the caller
/// through [`OfflineActionLog::purge_synced`].
#[derive(Debug, Default)]
pub struct OfflineActionLog {
    records: Vec<OfflineActionRecord>,
}

impl OfflineActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load persisted records, skipping ids already present.
    pub fn restore(&mut self, records: Vec<OfflineActionRecord>) -> usize {
        let mut restored = 0;
        for record in records {
            if self.records.iter().any(|r| r.id == record.id) {
                tracing::warn!(action_id = %record.id, "skipping duplicate offline action");
                continue;
            }
            self.records.push(record);
            restored += 1;
        }
        restored
    }

    pub fn record(&mut self, kind: SyncKind, payload: Value, now: DateTime<Utc>) -> ActionId {
        let id = ActionId::new();
        self.records.push(OfflineActionRecord {
            id,
            kind,
            payload,
            timestamp: now,
            synced: false,
        });
        id
    }

    /// Flip `id` to synced. Returns `false` if unknown or already synced.
    pub fn mark_synced(&mut self, id: ActionId) -> bool {
        match self.records.iter_mut().find(|r| r.id == id) {
            Some(record) if !record.synced => {
                record.synced = true;
                true
            }
            _ => false,
        }
    }

    pub fn unsynced_count(&self) -> usize {
        self.records.iter().filter(|r| !r.synced).count()
    }

    /// Drop every synced record. Returns how many were removed.
    pub fn purge_synced(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|r| !r.synced);
        before - self.records.len()
    }

    pub fn records(&self) -> &[OfflineActionRecord] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Transition reported by the platform's connectivity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    BecameOnline,
    BecameOffline,
}

/// Lock-free connectivity flag shared by the coordinator and its tasks.
#[derive(Debug)]
pub struct Connectivity {
    online: AtomicBool,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    /// Apply an event. Returns `true` if the state changed.
    pub fn apply(&self, event: ConnectivityEvent) -> bool {
        let online = matches!(event, ConnectivityEvent::BecameOnline);
        self.set(online)
    }

    /// Set the flag. Returns `true` if the state changed.
    pub fn set(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst) != online
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_start_unsynced() {
        let mut log = OfflineActionLog::new();
        log.record(SyncKind::UserDataUpdate, json!({"a": 1}), Utc::now());
        log.record(SyncKind::SessionSave, json!({}), Utc::now());

        assert_eq!(log.unsynced_count(), 2);
        assert!(log.records().iter().all(|r| !r.synced));
    }

    #[test]
    fn mark_synced_is_idempotent() {
        let mut log = OfflineActionLog::new();
        let id = log.record(SyncKind::UserDataUpdate, json!({}), Utc::now());

        assert!(log.mark_synced(id));
        assert!(!log.mark_synced(id));
        assert!(!log.mark_synced(ActionId::new()));
        assert_eq!(log.unsynced_count(), 0);
    }

    #[test]
    fn purge_only_removes_synced_records() {
        let mut log = OfflineActionLog::new();
        let synced = log.record(SyncKind::UserDataUpdate, json!({}), Utc::now());
        let pending = log.record(SyncKind::ChartCalculation, json!({}), Utc::now());
        log.mark_synced(synced);

        assert_eq!(log.purge_synced(), 1);
        assert_eq!(log.records().len(), 1);
        assert_eq!(log.records()[0].id, pending);
    }

    #[test]
    fn restore_skips_known_ids() {
        let mut log = OfflineActionLog::new();
        log.record(SyncKind::SessionSave, json!({}), Utc::now());
        let existing = log.records().to_vec();

        assert_eq!(log.restore(existing), 0);
        assert_eq!(log.records().len(), 1);
    }

    #[test]
    fn connectivity_reports_transitions_only() {
        let connectivity = Connectivity::new(false);
        assert!(!connectivity.is_online());

        assert!(connectivity.apply(ConnectivityEvent::BecameOnline));
        assert!(!connectivity.apply(ConnectivityEvent::BecameOnline));
        assert!(connectivity.is_online());

        assert!(connectivity.apply(ConnectivityEvent::BecameOffline));
        assert!(!connectivity.is_online());
    }
}
