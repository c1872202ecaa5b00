//! In-memory broadcaster for tests/dev and single-process deployments.

use std::sync::{Mutex, mpsc};

use crate::bus::{BroadcastError, Broadcaster, Subscription};
use crate::message::BroadcastMessage;

/// In-memory pub/sub broadcaster.
///
/// - No IO / no async
/// - Best-effort fan-out
/// - Dead subscribers are dropped on the next publish
#[derive(Debug, Default)]
pub struct InMemoryBroadcaster {
    subscribers: Mutex<Vec<mpsc::Sender<BroadcastMessage>>>,
}

impl InMemoryBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Broadcaster for InMemoryBroadcaster {
    fn publish(&self, message: BroadcastMessage) -> Result<(), BroadcastError> {
        let mut subs = self.subscribers.lock().map_err(|_| BroadcastError::Poisoned)?;

        subs.retain(|tx| tx.send(message.clone()).is_ok());
        tracing::trace!(topic = %message.topic, receivers = subs.len(), "broadcast published");

        Ok(())
    }

    fn subscribe(&self) -> Subscription<BroadcastMessage> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}
