//! In-memory sync queue: admission, selection, and completion.
//!
//! Every mutation of queued items goes through this type. The coordinator
//! keeps it behind a single mutex, so there is exactly one writer at a time.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use offsync_core::ItemId;

use crate::error::SyncError;
use crate::types::{EnqueueRequest, SyncQueueItem};

/// What happened to an item after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// Still queued; will be selected again at `next_eligible_at`.
    Retrying {
        attempt_count: u32,
        next_eligible_at: DateTime<Utc>,
    },
    /// Budget exhausted; the item has been removed and is returned here.
    PermanentFailure(SyncQueueItem),
}

/// Ordered set of pending items.
#[derive(Debug, Default)]
pub struct SyncQueue {
    items: HashMap<ItemId, SyncQueueItem>,
    next_sequence: u64,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an item from `request` and add it.
    ///
    /// The item is immediately due. A zero budget is raised to one attempt.
    pub fn admit(
        &mut self,
        request: EnqueueRequest,
        default_max_attempts: u32,
        now: DateTime<Utc>,
    ) -> ItemId {
        let mut id = ItemId::new();
        while self.items.contains_key(&id) {
            id = ItemId::new();
        }

        let item = SyncQueueItem {
            id,
            kind: request.kind,
            payload: request.payload,
            target: request.target,
            priority: request.priority,
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts).max(1),
            attempt_count: 0,
            created_at: now,
            next_eligible_at: now,
            sequence: self.next_sequence,
            offline_action: request.offline_action,
        };

        self.next_sequence += 1;
        self.items.insert(id, item);
        id
    }

    /// Add a fully-formed item (e.g. one read back from storage).
    pub fn insert(&mut self, item: SyncQueueItem) -> Result<(), SyncError> {
        if self.items.contains_key(&item.id) {
            return Err(SyncError::DuplicateItem(item.id));
        }

        self.next_sequence = self.next_sequence.max(item.sequence.saturating_add(1));
        self.items.insert(item.id, item);
        Ok(())
    }

    /// Admit persisted items, skipping duplicates. Returns how many were restored.
    pub fn restore(&mut self, items: Vec<SyncQueueItem>) -> usize {
        let mut restored = 0;
        for mut item in items {
            // Repair state written by an older or interrupted process.
            item.max_attempts = item.max_attempts.max(1);
            if item.attempt_count >= item.max_attempts {
                tracing::warn!(item_id = %item.id, "dropping persisted item with exhausted budget");
                continue;
            }
            if item.next_eligible_at < item.created_at {
                item.next_eligible_at = item.created_at;
            }

            match self.insert(item) {
                Ok(()) => restored += 1,
                Err(err) => tracing::warn!(error = %err, "skipping persisted item"),
            }
        }
        restored
    }

    /// Items due at `now`, in delivery order.
    ///
    /// Order: priority descending, then `created_at` ascending, then admission
    /// sequence. The sequence makes the order total.
    pub fn select_due(&self, now: DateTime<Utc>) -> Vec<SyncQueueItem> {
        let mut due: Vec<SyncQueueItem> = self
            .items
            .values()
            .filter(|item| item.is_due(now))
            .cloned()
            .collect();
        sort_for_delivery(&mut due);
        due
    }

    /// Delete an item (delivery succeeded).
    pub fn remove(&mut self, id: ItemId) -> Option<SyncQueueItem> {
        self.items.remove(&id)
    }

    /// Count a failed attempt against `id`.
    ///
    /// Returns `None` if the item is no longer queued (e.g. cleared while the
    /// attempt was in flight).
    pub fn record_failure(
        &mut self,
        id: ItemId,
        retry_after: Duration,
        now: DateTime<Utc>,
    ) -> Option<FailureDisposition> {
        let item = self.items.get_mut(&id)?;
        item.attempt_count = item.attempt_count.saturating_add(1);

        if item.attempt_count >= item.max_attempts {
            return self.items.remove(&id).map(FailureDisposition::PermanentFailure);
        }

        let delay = chrono::Duration::from_std(retry_after).unwrap_or(chrono::Duration::MAX);
        let next = now
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        item.next_eligible_at = next.max(item.created_at);

        Some(FailureDisposition::Retrying {
            attempt_count: item.attempt_count,
            next_eligible_at: item.next_eligible_at,
        })
    }

    pub fn get(&self, id: ItemId) -> Option<&SyncQueueItem> {
        self.items.get(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Every queued item (due or not), in delivery order.
    pub fn snapshot(&self) -> Vec<SyncQueueItem> {
        let mut all: Vec<SyncQueueItem> = self.items.values().cloned().collect();
        sort_for_delivery(&mut all);
        all
    }

    /// Earliest `next_eligible_at` among queued items.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

fn sort_for_delivery(items: &mut [SyncQueueItem]) {
    items.sort_by_key(|i| (Reverse(i.priority), i.created_at, i.sequence));
}
