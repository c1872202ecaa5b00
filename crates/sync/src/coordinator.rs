//! Sync coordinator: decides when passes run and applies their outcomes.
//!
//! Passes are triggered by enqueue, by reconnecting (after a settle delay),
//! and by a periodic timer. At most one pass runs at a time; a request that
//! arrives while a pass is running is dropped, since the running pass (or the
//! next timer tick) picks the work up.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use offsync_core::{ActionId, Clock, ItemId, SystemClock};
use offsync_events::{Broadcaster, InMemoryBroadcaster};
use offsync_infra::{KeyValueStore, Notification, Notifier, TracingNotifier, Transport, Urgency};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SyncConfig;
use crate::error::{DeliveryFailure, SyncError};
use crate::executor::{DeliveryExecutor, DeliveryOutcome, ResponseBody, TokenAccessor};
use crate::handlers::{SuccessHooks, plan_success};
use crate::offline::{Connectivity, ConnectivityEvent, OfflineActionLog};
use crate::persistence::QueueStore;
use crate::queue::{FailureDisposition, SyncQueue};
use crate::types::{
    EnqueueRequest, OfflineActionRecord, PermanentFailureRecord, SyncKind, SyncQueueItem,
    SyncStatus,
};

/// How many permanent failures `recent_permanent_failures` keeps.
pub const RECENT_FAILURE_HISTORY: usize = 50;

pub const TAG_SYNC_COMPLETE: &str = "sync-complete";
pub const TAG_SYNC_FAILED: &str = "sync-failed";

/// External collaborators injected into the coordinator.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn Notifier>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub token: Option<TokenAccessor>,
}

impl Collaborators {
    /// System clock, log-only notifications, in-process broadcasts, no token.
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            transport,
            store,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(TracingNotifier),
            broadcaster: Arc::new(InMemoryBroadcaster::new()),
            token: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn with_token<F>(mut self, token: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.token = Some(Arc::new(token));
        self
    }
}

/// Summary of one pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub attempted: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub permanently_failed: usize,
    /// Per-item failures and persistence errors, in the order they happened.
    pub errors: Vec<SyncError>,
    /// Connectivity dropped before every due item was attempted.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassState {
    Idle,
    Running,
}

/// Held for the duration of a pass. Dropping it returns the state to idle.
struct PassGuard {
    inner: Arc<Inner>,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.inner.pass_state.send_replace(PassState::Idle);
    }
}

struct Inner {
    config: SyncConfig,
    queue: Mutex<SyncQueue>,
    actions: Mutex<OfflineActionLog>,
    store: QueueStore,
    executor: DeliveryExecutor,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    broadcaster: Arc<dyn Broadcaster>,
    connectivity: Connectivity,
    pass_state: watch::Sender<PassState>,
    stopped: AtomicBool,
    permanent_failures: AtomicU64,
    recent_failures: std::sync::Mutex<VecDeque<PermanentFailureRecord>>,
    hooks: RwLock<SuccessHooks>,
}

/// Owner of the sync queue and the offline-action log.
///
/// Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("online", &self.inner.connectivity.is_online())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    /// Build a coordinator and restore persisted state.
    ///
    /// Unreadable persisted state is logged and replaced by an empty queue.
    pub async fn open(config: SyncConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            transport,
            store,
            clock,
            notifier,
            broadcaster,
            token,
        } = collaborators;

        let store = QueueStore::with_keys(store, config.queue_key.clone(), config.actions_key.clone());

        let mut queue = SyncQueue::new();
        match store.load_queue().await {
            Ok(items) => {
                let restored = queue.restore(items);
                if restored > 0 {
                    tracing::info!(restored, "restored persisted sync queue");
                }
            }
            Err(err) => tracing::warn!(error = %err, "could not read persisted queue; starting empty"),
        }

        let mut actions = OfflineActionLog::new();
        match store.load_actions().await {
            Ok(records) => {
                actions.restore(records);
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not read persisted offline actions; starting empty")
            }
        }

        let executor = DeliveryExecutor::new(
            transport,
            config.api_url.clone(),
            config.backoff,
            config.attempt_timeout,
        )
        .with_token(token);

        let (pass_state, _) = watch::channel(PassState::Idle);

        Self {
            inner: Arc::new(Inner {
                connectivity: Connectivity::new(config.start_online),
                config,
                queue: Mutex::new(queue),
                actions: Mutex::new(actions),
                store,
                executor,
                clock,
                notifier,
                broadcaster,
                pass_state,
                stopped: AtomicBool::new(false),
                permanent_failures: AtomicU64::new(0),
                recent_failures: std::sync::Mutex::new(VecDeque::with_capacity(RECENT_FAILURE_HISTORY)),
                hooks: RwLock::new(SuccessHooks::default()),
            }),
        }
    }

    /// Queue a write for delivery and trigger a pass.
    ///
    /// The queue is persisted before this returns. A persistence failure is
    /// logged and the item stays queued in memory.
    pub async fn enqueue(&self, request: EnqueueRequest) -> ItemId {
        let kind = request.kind;
        let priority = request.priority;
        let now = self.inner.clock.now();

        let id = {
            let mut queue = self.inner.queue.lock().await;
            let id = queue.admit(request, self.inner.config.default_max_attempts, now);
            if let Err(err) = self.inner.store.save_queue(&queue.snapshot(), now).await {
                tracing::warn!(item_id = %id, error = %err, "failed to persist queue; item kept in memory");
            }
            id
        };

        tracing::info!(item_id = %id, %kind, ?priority, "queued for sync");
        self.request_pass();
        id
    }

    /// Start a pass in the background if online and idle.
    ///
    /// Returns `true` if a pass was started.
    pub fn request_pass(&self) -> bool {
        if self.inner.stopped.load(Ordering::SeqCst) {
            tracing::debug!("coordinator stopped; pass not scheduled");
            return false;
        }
        if !self.inner.connectivity.is_online() {
            tracing::debug!("offline; pass deferred");
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no async runtime; pass not started");
            return false;
        };
        let Some(guard) = self.try_begin_pass() else {
            tracing::debug!("pass already running");
            return false;
        };

        let coordinator = self.clone();
        runtime.spawn(async move {
            let report = coordinator.execute_pass(&guard).await;
            drop(guard);
            log_report(&report);
        });
        true
    }

    /// Run a pass on the current task.
    ///
    /// Returns `None` without doing anything if offline or if another pass is
    /// running.
    pub async fn run_pass(&self) -> Option<PassReport> {
        if !self.inner.connectivity.is_online() {
            return None;
        }
        let guard = self.try_begin_pass()?;
        let report = self.execute_pass(&guard).await;
        drop(guard);
        log_report(&report);
        Some(report)
    }

    /// Wait until no pass is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.pass_state.subscribe();
        let _ = rx.wait_for(|state| *state == PassState::Idle).await;
    }

    /// React to a connectivity transition.
    ///
    /// Coming online schedules a pass after the settle delay, provided the
    /// client is still online by then.
    pub fn connectivity_changed(&self, event: ConnectivityEvent) {
        if !self.inner.connectivity.apply(event) {
            return;
        }

        match event {
            ConnectivityEvent::BecameOffline => tracing::info!("connectivity lost; sync paused"),
            ConnectivityEvent::BecameOnline => {
                tracing::info!(settle_ms = self.inner.config.reconnect_settle.as_millis() as u64, "connectivity restored");

                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    tracing::warn!("no async runtime; reconnect pass not scheduled");
                    return;
                };
                let coordinator = self.clone();
                let settle = self.inner.config.reconnect_settle;
                runtime.spawn(async move {
                    tokio::time::sleep(settle).await;
                    if coordinator.inner.connectivity.is_online() {
                        coordinator.request_pass();
                    }
                });
            }
        }
    }

    /// Spawn the background loop (timer only).
    pub fn start(&self) -> SyncHandle {
        self.spawn_loop(None)
    }

    /// Spawn the background loop, also consuming connectivity events from `events`.
    pub fn start_with_connectivity(&self, events: mpsc::Receiver<ConnectivityEvent>) -> SyncHandle {
        self.spawn_loop(Some(events))
    }

    fn spawn_loop(&self, mut events: Option<mpsc::Receiver<ConnectivityEvent>>) -> SyncHandle {
        self.inner.stopped.store(false, Ordering::SeqCst);

        let shutdown = Arc::new(Notify::new());
        let shutdown_rx = shutdown.clone();
        let coordinator = self.clone();
        let period = self.inner.config.sync_interval;

        let join = tokio::spawn(async move {
            tracing::info!(interval_secs = period.as_secs(), "sync loop started");

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.notified() => {
                        tracing::info!("sync loop received shutdown signal");
                        break;
                    }
                    event = next_event(&mut events) => match event {
                        Some(event) => coordinator.connectivity_changed(event),
                        None => {
                            tracing::debug!("connectivity channel closed");
                            events = None;
                        }
                    },
                    _ = ticker.tick() => {
                        coordinator.request_pass();
                    }
                }
            }

            tracing::info!("sync loop stopped");
        });

        SyncHandle {
            shutdown,
            join: Some(join),
            coordinator: self.clone(),
        }
    }

    pub async fn status(&self) -> SyncStatus {
        let queued_count = self.inner.queue.lock().await.len();
        let unsynced_offline_action_count = self.inner.actions.lock().await.unsynced_count();

        SyncStatus {
            online: self.inner.connectivity.is_online(),
            running: self.is_running(),
            queued_count,
            unsynced_offline_action_count,
            permanent_failure_count_since_clear: self.inner.permanent_failures.load(Ordering::SeqCst),
        }
    }

    /// Drop every queued item and offline action, then persist the empty state.
    pub async fn clear(&self) {
        let now = self.inner.clock.now();
        {
            let mut queue = self.inner.queue.lock().await;
            queue.clear();
            if let Err(err) = self.inner.store.save_queue(&[], now).await {
                tracing::warn!(error = %err, "failed to persist cleared queue");
            }
        }
        {
            let mut actions = self.inner.actions.lock().await;
            actions.clear();
            if let Err(err) = self.inner.store.save_actions(&[], now).await {
                tracing::warn!(error = %err, "failed to persist cleared offline actions");
            }
        }

        self.inner.permanent_failures.store(0, Ordering::SeqCst);
        self.recent_failures_mut().clear();
        tracing::info!("sync queue cleared");
    }

    /// Record a user action captured while disconnected.
    pub async fn record_offline_action(&self, kind: SyncKind, payload: Value) -> ActionId {
        let now = self.inner.clock.now();
        let mut actions = self.inner.actions.lock().await;
        let id = actions.record(kind, payload, now);
        if let Err(err) = self.inner.store.save_actions(actions.records(), now).await {
            tracing::warn!(action_id = %id, error = %err, "failed to persist offline action");
        }
        tracing::debug!(action_id = %id, %kind, "offline action recorded");
        id
    }

    pub async fn offline_actions(&self) -> Vec<OfflineActionRecord> {
        self.inner.actions.lock().await.records().to_vec()
    }

    /// Remove synced offline actions. Returns how many were removed.
    pub async fn purge_synced_actions(&self) -> usize {
        let now = self.inner.clock.now();
        let mut actions = self.inner.actions.lock().await;
        let purged = actions.purge_synced();
        if purged > 0 {
            if let Err(err) = self.inner.store.save_actions(actions.records(), now).await {
                tracing::warn!(error = %err, "failed to persist purged offline actions");
            }
        }
        purged
    }

    /// Every queued item in delivery order.
    pub async fn queued_items(&self) -> Vec<SyncQueueItem> {
        self.inner.queue.lock().await.snapshot()
    }

    /// Most recent permanent failures, oldest first.
    pub fn recent_permanent_failures(&self) -> Vec<PermanentFailureRecord> {
        self.recent_failures_mut().iter().cloned().collect()
    }

    /// Run `hook` after every successful delivery of `kind`.
    ///
    /// A panicking hook is logged and does not affect the rest of the pass.
    pub fn register_success_hook<F>(&self, kind: SyncKind, hook: F)
    where
        F: Fn(&SyncQueueItem, &ResponseBody) + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .register(kind, Arc::new(hook));
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    fn is_running(&self) -> bool {
        *self.inner.pass_state.borrow() == PassState::Running
    }

    fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    fn try_begin_pass(&self) -> Option<PassGuard> {
        let acquired = self.inner.pass_state.send_if_modified(|state| {
            if *state == PassState::Idle {
                *state = PassState::Running;
                true
            } else {
                false
            }
        });

        acquired.then(|| PassGuard {
            inner: self.inner.clone(),
        })
    }

    fn recent_failures_mut(&self) -> std::sync::MutexGuard<'_, VecDeque<PermanentFailureRecord>> {
        self.inner
            .recent_failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    async fn execute_pass(&self, _guard: &PassGuard) -> PassReport {
        let mut report = PassReport::default();
        let due = self.inner.queue.lock().await.select_due(self.inner.clock.now());
        if due.is_empty() {
            return report;
        }

        tracing::debug!(due = due.len(), "sync pass started");
        let mut actions_dirty = false;

        for selected in due {
            if !self.inner.connectivity.is_online() {
                report.interrupted = true;
                tracing::info!("connectivity lost mid-pass; remaining items deferred");
                break;
            }

            // The queue may have been cleared or changed since the snapshot.
            let Some(item) = self.inner.queue.lock().await.get(selected.id).cloned() else {
                tracing::debug!(item_id = %selected.id, "item left the queue mid-pass; skipped");
                continue;
            };

            report.attempted += 1;
            let outcome = self.inner.executor.attempt(&item).await;
            let now = self.inner.clock.now();

            match outcome {
                DeliveryOutcome::Success(body) => {
                    if self.inner.queue.lock().await.remove(item.id).is_none() {
                        tracing::debug!(item_id = %item.id, "delivered item was cleared in flight");
                    }
                    report.delivered += 1;
                    tracing::info!(item_id = %item.id, kind = %item.kind, attempt = item.attempt_count + 1, "delivered");

                    if self.apply_success(&item, &body, &mut report).await {
                        actions_dirty = true;
                    }
                }
                DeliveryOutcome::Failure { failure, retry_after } => {
                    let disposition = self
                        .inner
                        .queue
                        .lock()
                        .await
                        .record_failure(item.id, retry_after, now);

                    match disposition {
                        Some(FailureDisposition::Retrying {
                            attempt_count,
                            next_eligible_at,
                        }) => {
                            report.retrying += 1;
                            let err = SyncError::TransientDelivery {
                                id: item.id,
                                attempt: attempt_count,
                                next_eligible_at,
                                failure,
                            };
                            tracing::warn!(item_id = %item.id, kind = %item.kind, attempt = attempt_count, error = %err, "delivery failed; will retry");
                            report.errors.push(err);
                        }
                        Some(FailureDisposition::PermanentFailure(dropped)) => {
                            report.permanently_failed += 1;
                            self.record_permanent_failure(&dropped, &failure, now);
                            report.errors.push(SyncError::PermanentDelivery {
                                id: dropped.id,
                                attempts: dropped.attempt_count,
                                failure,
                            });
                        }
                        None => {
                            tracing::debug!(item_id = %item.id, "failed item was cleared in flight");
                        }
                    }
                }
            }
        }

        let now = self.inner.clock.now();
        {
            let queue = self.inner.queue.lock().await;
            if let Err(err) = self.inner.store.save_queue(&queue.snapshot(), now).await {
                tracing::warn!(error = %err, "failed to persist queue after pass");
                report.errors.push(err.into());
            }
        }
        if actions_dirty {
            let actions = self.inner.actions.lock().await;
            if let Err(err) = self.inner.store.save_actions(actions.records(), now).await {
                tracing::warn!(error = %err, "failed to persist offline actions after pass");
                report.errors.push(err.into());
            }
        }

        if report.delivered > 0 {
            let body = if report.delivered == 1 {
                "1 pending change was synced".to_string()
            } else {
                format!("{} pending changes were synced", report.delivered)
            };
            self.inner.notifier.notify(Notification::new(
                "Sync complete",
                body,
                TAG_SYNC_COMPLETE,
                Urgency::Normal,
            ));
        }

        report
    }

    /// Run the kind's success handling. Returns `true` if an offline action
    /// was marked synced.
    async fn apply_success(&self, item: &SyncQueueItem, body: &ResponseBody, report: &mut PassReport) -> bool {
        let effects = plan_success(item, body);

        let mut action_synced = false;
        if let Some(action) = effects.mark_action_synced {
            action_synced = self.inner.actions.lock().await.mark_synced(action);
        }

        if let Some(write) = effects.cache_write {
            if let Err(err) = self.inner.store.save_cache(&write.key, &write.bytes).await {
                tracing::warn!(item_id = %item.id, key = %write.key, error = %err, "failed to cache response");
                report.errors.push(err.into());
            }
        }

        if let Some(message) = effects.broadcast {
            let topic = message.topic.clone();
            if let Err(err) = self.inner.broadcaster.publish(message) {
                tracing::warn!(item_id = %item.id, %topic, error = %err, "broadcast failed");
            }
        }

        let hook = self
            .inner
            .hooks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(item.kind);
        if let Some(hook) = hook {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(item, body))).is_err() {
                tracing::error!(item_id = %item.id, kind = %item.kind, "success hook panicked");
            }
        }

        action_synced
    }

    fn record_permanent_failure(&self, item: &SyncQueueItem, failure: &DeliveryFailure, now: DateTime<Utc>) {
        self.inner.permanent_failures.fetch_add(1, Ordering::SeqCst);

        tracing::error!(
            item_id = %item.id,
            kind = %item.kind,
            attempts = item.attempt_count,
            error = %failure,
            "delivery permanently failed; item dropped"
        );

        {
            let mut recent = self.recent_failures_mut();
            if recent.len() == RECENT_FAILURE_HISTORY {
                recent.pop_front();
            }
            recent.push_back(PermanentFailureRecord {
                item: item.clone(),
                reason: failure.to_string(),
                failed_at: now,
            });
        }

        self.inner.notifier.notify(Notification::new(
            "Sync failed",
            format!(
                "Could not sync {} to {} after {} attempts: {}",
                item.kind, item.target.endpoint, item.attempt_count, failure
            ),
            TAG_SYNC_FAILED,
            Urgency::High,
        ));
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<ConnectivityEvent>>) -> Option<ConnectivityEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn log_report(report: &PassReport) {
    if report.attempted == 0 {
        tracing::trace!("sync pass found nothing due");
        return;
    }
    tracing::info!(
        attempted = report.attempted,
        delivered = report.delivered,
        retrying = report.retrying,
        permanently_failed = report.permanently_failed,
        interrupted = report.interrupted,
        "sync pass finished"
    );
}

/// Handle to the background loop started by [`SyncCoordinator::start`].
pub struct SyncHandle {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
    coordinator: SyncCoordinator,
}

impl SyncHandle {
    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    /// Stop scheduling passes and wait for the loop to exit.
    ///
    /// A pass already in flight runs to completion on its own task.
    pub async fn shutdown(mut self) {
        self.coordinator.stop();
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                tracing::warn!(error = %err, "sync loop task failed");
            }
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.coordinator.stop();
            self.shutdown.notify_one();
        }
    }
}
