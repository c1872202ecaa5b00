//! User-visible notification sink.
//!
//! Notifications are fire-and-forget: a sink must never fail the caller.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// How prominently a notification should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    High,
}

/// A user-visible alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Replacement key: a newer notification with the same tag supersedes the old one.
    pub tag: String,
    pub urgency: Urgency,
}

impl Notification {
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        tag: impl Into<String>,
        urgency: Urgency,
    ) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            tag: tag.into(),
            urgency,
        }
    }
}

/// Notification sink abstraction.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    fn notify(&self, notification: Notification) {
        (**self).notify(notification)
    }
}

/// Sink that writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: Notification) {
        match n.urgency {
            Urgency::High => {
                tracing::warn!(tag = %n.tag, title = %n.title, body = %n.body, "notification")
            }
            Urgency::Normal | Urgency::Low => {
                tracing::info!(tag = %n.tag, title = %n.title, body = %n.body, "notification")
            }
        }
    }
}

/// Sink that records notifications in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every notification received so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Notifications carrying `tag`.
    pub fn with_tag(&self, tag: &str) -> Vec<Notification> {
        self.notifications()
            .into_iter()
            .filter(|n| n.tag == tag)
            .collect()
    }
}

impl Notifier for InMemoryNotifier {
    fn notify(&self, notification: Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }
}
