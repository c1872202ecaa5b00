//! Error taxonomy of the sync subsystem.
//!
//! None of these escape a pass: the coordinator logs them and collects them
//! into the pass report, one item at a time.

use chrono::{DateTime, Utc};
use offsync_core::ItemId;
use offsync_infra::{StoreError, TransportError};
use thiserror::Error;

/// Why a single delivery attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// The service answered with a non-2xx status.
    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// No response (network, timeout). Always transient.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reading or writing persisted queue state failed.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode/decode persisted state: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unsupported persisted format version {0}")]
    UnsupportedVersion(u32),
}

/// Sync-level error.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Attempt failed; the item stays queued with a later eligibility time.
    #[error("delivery of {id} failed on attempt {attempt}, retrying at {next_eligible_at}: {failure}")]
    TransientDelivery {
        id: ItemId,
        attempt: u32,
        next_eligible_at: DateTime<Utc>,
        failure: DeliveryFailure,
    },

    /// Retry budget exhausted; the item was dropped.
    #[error("delivery of {id} permanently failed after {attempts} attempts: {failure}")]
    PermanentDelivery {
        id: ItemId,
        attempts: u32,
        failure: DeliveryFailure,
    },

    /// Persisted state could not be written; in-memory state stays authoritative.
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("item {0} is already queued")]
    DuplicateItem(ItemId),
}

impl SyncError {
    /// Whether the failed work will be attempted again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SyncError::TransientDelivery { .. })
    }
}
