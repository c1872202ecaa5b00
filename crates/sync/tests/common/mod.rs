#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use offsync_core::ManualClock;
use offsync_events::InMemoryBroadcaster;
use offsync_infra::{
    InMemoryKvStore, InMemoryNotifier, Transport, TransportError, TransportRequest,
    TransportResponse,
};
use offsync_sync::{BackoffPolicy, Collaborators, SyncConfig, SyncCoordinator};

/// Transport that replays a script of replies, then answers `200 {}`.
///
/// Tracks how many sends overlap so tests can assert passes never run
/// concurrently.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    requests: Mutex<Vec<TransportRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Mutex<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: Result<TransportResponse, TransportError>) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn push_status(&self, status: u16) {
        self.push(Ok(TransportResponse::new(status, "")));
    }

    pub fn push_connect_error(&self) {
        self.push(Err(TransportError::Connect("connection refused".to_string())));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        self.requests.lock().unwrap().push(request);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(TransportResponse::new(200, "{}")));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

/// Coordinator wired to in-memory doubles.
pub struct Harness {
    pub coordinator: SyncCoordinator,
    pub transport: Arc<ScriptedTransport>,
    pub store: Arc<InMemoryKvStore>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<InMemoryNotifier>,
    pub broadcaster: Arc<InMemoryBroadcaster>,
}

/// Deterministic config: no jitter, instant reconnect, long timer.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        api_url: "https://api.example.test".to_string(),
        sync_interval: Duration::from_secs(3600),
        reconnect_settle: Duration::from_millis(10),
        backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300), Duration::ZERO),
        ..SyncConfig::default()
    }
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: SyncConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryKvStore::new())).await
    }

    /// Open a coordinator over an existing store (simulates a restart).
    pub async fn with_store(config: SyncConfig, store: Arc<InMemoryKvStore>) -> Self {
        let transport = ScriptedTransport::new();
        let clock = Arc::new(ManualClock::new(start_time()));
        let notifier = Arc::new(InMemoryNotifier::new());
        let broadcaster = Arc::new(InMemoryBroadcaster::new());

        let collaborators = Collaborators::new(transport.clone(), store.clone())
            .with_clock(clock.clone())
            .with_notifier(notifier.clone())
            .with_broadcaster(broadcaster.clone());

        let coordinator = SyncCoordinator::open(config, collaborators).await;

        Self {
            coordinator,
            transport,
            store,
            clock,
            notifier,
            broadcaster,
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }
}
