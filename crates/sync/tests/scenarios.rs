mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{Harness, test_config};
use offsync_events::Broadcaster;
use offsync_infra::TransportResponse;
use offsync_sync::coordinator::{TAG_SYNC_COMPLETE, TAG_SYNC_FAILED};
use offsync_sync::handlers::{TOPIC_CHART_CALCULATED, TOPIC_USER_DATA_UPDATED};
use offsync_sync::{
    ConnectivityEvent, EnqueueRequest, Priority, ResponseBody, SyncConfig, SyncError, SyncKind,
    SyncQueueItem, SyncTarget, cache_key,
};
use serde_json::json;
use tokio::sync::mpsc;

fn user_update() -> EnqueueRequest {
    EnqueueRequest::new(
        SyncKind::UserDataUpdate,
        json!({"display_name": "Ada"}),
        SyncTarget::put("/users/me"),
    )
}

fn offline_config() -> SyncConfig {
    SyncConfig {
        start_online: false,
        // Reconnect passes are driven explicitly in these tests.
        reconnect_settle: Duration::from_secs(3600),
        ..test_config()
    }
}

async fn wait_until_empty(h: &Harness) {
    for _ in 0..200 {
        if h.coordinator.status().await.queued_count == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue never drained");
}

#[tokio::test]
async fn retries_twice_then_delivers() {
    let h = Harness::new().await;
    h.transport.push_connect_error();
    h.transport.push_status(503);

    let id = h.coordinator.enqueue(user_update().max_attempts(3)).await;
    h.coordinator.wait_idle().await;

    let items = h.coordinator.queued_items().await;
    assert_eq!(items[0].id, id);
    assert_eq!(items[0].attempt_count, 1);

    // Not due yet.
    let report = h.coordinator.run_pass().await.unwrap();
    assert_eq!(report.attempted, 0);

    h.advance(chrono::Duration::seconds(1));
    let report = h.coordinator.run_pass().await.unwrap();
    assert_eq!(report.retrying, 1);
    assert!(report.errors[0].is_retriable());
    assert_eq!(h.coordinator.queued_items().await[0].attempt_count, 2);

    h.advance(chrono::Duration::seconds(2));
    let report = h.coordinator.run_pass().await.unwrap();
    assert_eq!(report.delivered, 1);

    assert_eq!(h.coordinator.status().await.queued_count, 0);
    assert_eq!(h.transport.request_count(), 3);
    assert_eq!(h.notifier.with_tag(TAG_SYNC_COMPLETE).len(), 1);
    assert!(h.notifier.with_tag(TAG_SYNC_FAILED).is_empty());
}

#[tokio::test]
async fn high_priority_is_attempted_before_low() {
    let h = Harness::with_config(offline_config()).await;
    h.transport.push_status(500);
    h.transport.push_status(500);

    let low = EnqueueRequest::new(SyncKind::SessionSave, json!({}), SyncTarget::post("/c"))
        .priority(Priority::Low)
        .max_attempts(1);
    let high = EnqueueRequest::new(SyncKind::SessionSave, json!({}), SyncTarget::post("/b"))
        .priority(Priority::High)
        .max_attempts(1);
    h.coordinator.enqueue(low).await;
    h.coordinator.enqueue(high).await;

    h.coordinator.connectivity_changed(ConnectivityEvent::BecameOnline);
    let report = h.coordinator.run_pass().await.unwrap();

    assert_eq!(report.permanently_failed, 2);
    let urls: Vec<_> = h.transport.requests().into_iter().map(|r| r.url).collect();
    assert_eq!(
        urls,
        vec!["https://api.example.test/b", "https://api.example.test/c"]
    );
}

#[tokio::test]
async fn transient_failures_accumulate_attempts() {
    let h = Harness::new().await;
    for _ in 0..3 {
        h.transport.push_status(502);
    }

    h.coordinator.enqueue(user_update().max_attempts(5)).await;
    h.coordinator.wait_idle().await;
    for _ in 0..2 {
        h.advance(chrono::Duration::minutes(10));
        h.coordinator.run_pass().await.unwrap();
    }

    let items = h.coordinator.queued_items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].attempt_count, 3);
    assert!(items[0].next_eligible_at > items[0].created_at);
    assert!(h.notifier.notifications().is_empty());
}

#[tokio::test]
async fn exhausted_item_is_dropped_and_notified_once() {
    let h = Harness::new().await;
    h.transport.push_status(400);
    h.transport.push_status(400);

    let id = h.coordinator.enqueue(user_update().max_attempts(2)).await;
    h.coordinator.wait_idle().await;

    h.advance(chrono::Duration::seconds(5));
    let report = h.coordinator.run_pass().await.unwrap();
    assert_eq!(report.permanently_failed, 1);
    assert!(matches!(
        &report.errors[0],
        SyncError::PermanentDelivery { id: failed, attempts: 2, .. } if *failed == id
    ));

    h.advance(chrono::Duration::minutes(10));
    let report = h.coordinator.run_pass().await.unwrap();
    assert_eq!(report.attempted, 0);

    let status = h.coordinator.status().await;
    assert_eq!(status.queued_count, 0);
    assert_eq!(status.permanent_failure_count_since_clear, 1);
    assert_eq!(h.transport.request_count(), 2);

    let failed = h.notifier.with_tag(TAG_SYNC_FAILED);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].body.contains("/users/me"));
    assert!(h.notifier.with_tag(TAG_SYNC_COMPLETE).is_empty());

    let history = h.coordinator.recent_permanent_failures();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].item.id, id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rapid_enqueues_never_overlap_passes() {
    let h = Harness::new().await;
    h.transport.set_delay(Duration::from_millis(1));

    let mut tasks = Vec::new();
    for i in 0..100 {
        let coordinator = h.coordinator.clone();
        tasks.push(tokio::spawn(async move {
            coordinator
                .enqueue(EnqueueRequest::new(
                    SyncKind::NotificationDelivery,
                    json!({"n": i}),
                    SyncTarget::post("/notifications"),
                ))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Items admitted after a pass took its snapshot wait for the next trigger.
    for _ in 0..200 {
        h.coordinator.wait_idle().await;
        if h.coordinator.status().await.queued_count == 0 {
            break;
        }
        h.coordinator.run_pass().await;
    }

    assert_eq!(h.coordinator.status().await.queued_count, 0);
    assert_eq!(h.transport.request_count(), 100);
    assert_eq!(h.transport.max_in_flight(), 1);
}

#[tokio::test]
async fn nothing_is_sent_while_offline() {
    let h = Harness::with_config(offline_config()).await;

    h.coordinator.enqueue(user_update()).await;
    assert!(!h.coordinator.request_pass());
    assert!(h.coordinator.run_pass().await.is_none());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let status = h.coordinator.status().await;
    assert!(!status.online);
    assert!(!status.running);
    assert_eq!(status.queued_count, 1);
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test]
async fn reconnecting_drains_the_queue_after_settling() {
    let config = SyncConfig {
        start_online: false,
        ..test_config()
    };
    let h = Harness::with_config(config).await;
    h.coordinator.enqueue(user_update()).await;
    h.coordinator.enqueue(user_update()).await;

    let (tx, rx) = mpsc::channel(4);
    let handle = h.coordinator.start_with_connectivity(rx);
    tx.send(ConnectivityEvent::BecameOnline).await.unwrap();

    wait_until_empty(&h).await;
    assert!(h.coordinator.is_online());
    assert_eq!(h.transport.request_count(), 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn flapping_connection_does_not_sync() {
    let config = SyncConfig {
        start_online: false,
        reconnect_settle: Duration::from_millis(50),
        ..test_config()
    };
    let h = Harness::with_config(config).await;
    h.coordinator.enqueue(user_update()).await;

    h.coordinator.connectivity_changed(ConnectivityEvent::BecameOnline);
    h.coordinator.connectivity_changed(ConnectivityEvent::BecameOffline);
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(h.transport.request_count(), 0);
    assert_eq!(h.coordinator.status().await.queued_count, 1);
}

#[tokio::test]
async fn going_offline_mid_pass_defers_the_rest() {
    let h = Harness::with_config(offline_config()).await;
    h.transport.set_delay(Duration::from_millis(50));
    for _ in 0..3 {
        h.coordinator.enqueue(user_update()).await;
    }
    h.coordinator.connectivity_changed(ConnectivityEvent::BecameOnline);

    let coordinator = h.coordinator.clone();
    let pass = tokio::spawn(async move { coordinator.run_pass().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.coordinator.connectivity_changed(ConnectivityEvent::BecameOffline);

    let report = pass.await.unwrap().unwrap();
    assert!(report.interrupted);
    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(h.coordinator.status().await.queued_count, 2);
}

#[tokio::test]
async fn clearing_mid_pass_sends_nothing_further() {
    let h = Harness::with_config(offline_config()).await;
    h.transport.set_delay(Duration::from_millis(50));
    for _ in 0..3 {
        h.coordinator.enqueue(user_update()).await;
    }
    h.coordinator.connectivity_changed(ConnectivityEvent::BecameOnline);

    let coordinator = h.coordinator.clone();
    let pass = tokio::spawn(async move { coordinator.run_pass().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.coordinator.clear().await;

    let report = pass.await.unwrap().unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(h.transport.request_count(), 1);
    assert_eq!(h.coordinator.status().await.queued_count, 0);

    let reopened = Harness::with_store(offline_config(), h.store.clone()).await;
    assert!(reopened.coordinator.queued_items().await.is_empty());
}

#[tokio::test]
async fn timer_picks_up_backed_off_items() {
    let config = SyncConfig {
        sync_interval: Duration::from_millis(30),
        ..test_config()
    };
    let h = Harness::with_config(config).await;
    h.transport.push_status(503);

    h.coordinator.enqueue(user_update()).await;
    h.coordinator.wait_idle().await;
    assert_eq!(h.transport.request_count(), 1);

    let handle = h.coordinator.start();
    // Ticks before the backoff elapses find nothing due.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(h.transport.request_count(), 1);

    h.advance(chrono::Duration::seconds(5));
    wait_until_empty(&h).await;
    assert_eq!(h.transport.request_count(), 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn one_summary_notification_per_pass() {
    let h = Harness::with_config(offline_config()).await;
    for _ in 0..3 {
        h.coordinator.enqueue(user_update()).await;
    }
    h.coordinator.connectivity_changed(ConnectivityEvent::BecameOnline);

    let report = h.coordinator.run_pass().await.unwrap();
    assert_eq!(report.delivered, 3);

    let complete = h.notifier.with_tag(TAG_SYNC_COMPLETE);
    assert_eq!(complete.len(), 1);
    assert!(complete[0].body.contains('3'));
}

#[tokio::test]
async fn delivery_marks_the_offline_action_synced() {
    let h = Harness::with_config(offline_config()).await;
    let action = h
        .coordinator
        .record_offline_action(SyncKind::UserDataUpdate, json!({"display_name": "Ada"}))
        .await;
    h.coordinator.enqueue(user_update().correlated_with(action)).await;
    assert_eq!(h.coordinator.status().await.unsynced_offline_action_count, 1);

    h.coordinator.connectivity_changed(ConnectivityEvent::BecameOnline);
    h.coordinator.run_pass().await.unwrap();

    let actions = h.coordinator.offline_actions().await;
    assert_eq!(actions.len(), 1);
    assert!(actions[0].synced);
    assert_eq!(h.coordinator.status().await.unsynced_offline_action_count, 0);

    assert_eq!(h.coordinator.purge_synced_actions().await, 1);
    assert!(h.coordinator.offline_actions().await.is_empty());
}

#[tokio::test]
async fn user_data_update_is_broadcast() {
    let h = Harness::new().await;
    let sub = h.broadcaster.subscribe();

    let id = h.coordinator.enqueue(user_update()).await;
    h.coordinator.wait_idle().await;

    let msg = sub.try_recv().unwrap();
    assert_eq!(msg.topic, TOPIC_USER_DATA_UPDATED);
    assert_eq!(msg.payload["item_id"], json!(id));
    assert_eq!(msg.payload["endpoint"], "/users/me");
}

#[tokio::test]
async fn chart_results_are_cached() {
    let h = Harness::new().await;
    let sub = h.broadcaster.subscribe();
    h.transport.push(Ok(TransportResponse::new(200, r#"{"planets":10}"#)));

    h.coordinator
        .enqueue(EnqueueRequest::new(
            SyncKind::ChartCalculation,
            json!({"birth": "1990-01-01T00:00:00Z"}),
            SyncTarget::post("/charts/natal"),
        ))
        .await;
    h.coordinator.wait_idle().await;

    assert_eq!(
        h.store.get(&cache_key("/charts/natal")),
        Some(br#"{"planets":10}"#.to_vec())
    );
    assert_eq!(sub.try_recv().unwrap().topic, TOPIC_CHART_CALCULATED);
}

#[tokio::test]
async fn success_hooks_run_for_their_kind_only() {
    let h = Harness::with_config(offline_config()).await;
    let sessions = Arc::new(AtomicUsize::new(0));
    let counter = sessions.clone();
    h.coordinator
        .register_success_hook(SyncKind::SessionSave, move |item: &SyncQueueItem, body: &ResponseBody| {
            assert_eq!(item.kind, SyncKind::SessionSave);
            assert_eq!(body.status, 200);
            counter.fetch_add(1, Ordering::SeqCst);
        });

    h.coordinator
        .enqueue(EnqueueRequest::new(SyncKind::SessionSave, json!({}), SyncTarget::post("/sessions")))
        .await;
    h.coordinator.enqueue(user_update()).await;
    h.coordinator.connectivity_changed(ConnectivityEvent::BecameOnline);
    h.coordinator.run_pass().await.unwrap();

    assert_eq!(sessions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn requests_carry_json_payloads() {
    let h = Harness::new().await;

    h.coordinator.enqueue(user_update()).await;
    h.coordinator.wait_idle().await;

    let request = &h.transport.requests()[0];
    assert_eq!(request.url, "https://api.example.test/users/me");
    assert_eq!(request.header_value("content-type"), Some("application/json"));
    let body: serde_json::Value = serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
    assert_eq!(body, json!({"display_name": "Ada"}));
}

#[tokio::test]
async fn panicking_hook_does_not_abort_the_pass() {
    let h = Harness::with_config(offline_config()).await;
    h.coordinator
        .register_success_hook(SyncKind::SessionSave, |_: &SyncQueueItem, _: &ResponseBody| {
            panic!("hook failed");
        });

    h.coordinator
        .enqueue(EnqueueRequest::new(SyncKind::SessionSave, json!({}), SyncTarget::post("/sessions")))
        .await;
    h.coordinator.enqueue(user_update()).await;
    h.coordinator.connectivity_changed(ConnectivityEvent::BecameOnline);

    let report = h.coordinator.run_pass().await.unwrap();
    assert_eq!(report.delivered, 2);
    assert!(!h.coordinator.status().await.running);
    assert_eq!(h.notifier.with_tag(TAG_SYNC_COMPLETE).len(), 1);

    let reopened = Harness::with_store(offline_config(), h.store.clone()).await;
    assert!(reopened.coordinator.queued_items().await.is_empty());
}
