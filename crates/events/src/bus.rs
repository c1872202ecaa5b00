//! Broadcast publishing/subscription abstraction (mechanics only).
//!
//! The broadcaster is the messaging collaborator used to tell other processes
//! that a queued write reached the server. It makes minimal assumptions:
//!
//! - **Transport-agnostic**: in-memory channels, a platform broadcast channel, IPC, ...
//! - **Best-effort**: a failed publish is logged by the caller and never retried
//! - **No persistence**: messages published while nobody listens are lost
//!
//! Receivers must be idempotent; the sync queue is at-least-once, so the same
//! outcome may be announced more than once.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

use crate::message::BroadcastMessage;

/// A subscription to a broadcast stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics).
///
/// ```ignore
/// let sub = broadcaster.subscribe();
/// while let Ok(msg) = sub.recv_timeout(Duration::from_secs(1)) {
///     refresh(&msg.topic, &msg.payload);
/// }
/// ```
///
/// Subscriptions are designed for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain every message currently buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Broadcast failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// Publish failed due to internal lock poisoning.
    #[error("broadcast channel poisoned")]
    Poisoned,
    /// The underlying channel rejected the message.
    #[error("broadcast channel unavailable: {0}")]
    Unavailable(String),
}

/// Publish/subscribe channel to sibling processes.
///
/// The trait requires `Send + Sync`; passes publish from tokio tasks.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, message: BroadcastMessage) -> Result<(), BroadcastError>;

    fn subscribe(&self) -> Subscription<BroadcastMessage>;
}

impl<B> Broadcaster for Arc<B>
where
    B: Broadcaster + ?Sized,
{
    fn publish(&self, message: BroadcastMessage) -> Result<(), BroadcastError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<BroadcastMessage> {
        (**self).subscribe()
    }
}
