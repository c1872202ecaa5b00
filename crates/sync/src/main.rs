//! `offsync-agent`: runs the sync coordinator against a SQLite store.
//!
//! Reads newline-delimited JSON from stdin. Each line is either an enqueue
//! request or a connectivity update:
//!
//! ```text
//! {"kind":"user-data-update","target":{"method":"PUT","endpoint":"/users/me"},"payload":{"name":"Ada"}}
//! {"online":false}
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use offsync_infra::{HttpTransport, SqliteKvStore};
use offsync_observability::LogFormat;
use offsync_sync::{Collaborators, ConnectivityEvent, EnqueueRequest, SyncConfig, SyncCoordinator};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AgentCommand {
    Connectivity { online: bool },
    Enqueue(EnqueueRequest),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = std::env::var("OFFSYNC_LOG_FORMAT")
        .ok()
        .and_then(|v| LogFormat::parse(&v))
        .unwrap_or_default();
    offsync_observability::init_with(format, "info");

    let config = SyncConfig::from_env().context("invalid OFFSYNC_* configuration")?;

    let db_path = match std::env::var("OFFSYNC_DB_PATH") {
        Ok(path) => PathBuf::from(path),
        Err(_) => offsync_infra::kv::sqlite::default_db_path()?,
    };
    let store = SqliteKvStore::open(&db_path)
        .await
        .with_context(|| format!("failed to open queue store at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "queue store opened");

    let transport = HttpTransport::new(config.attempt_timeout).context("failed to build HTTP client")?;

    let mut collaborators = Collaborators::new(Arc::new(transport), Arc::new(store));
    if let Ok(token) = std::env::var("OFFSYNC_AUTH_TOKEN") {
        tracing::info!("using bearer token from OFFSYNC_AUTH_TOKEN");
        collaborators = collaborators.with_token(move || Some(token.clone()));
    }

    let coordinator = SyncCoordinator::open(config, collaborators).await;
    let (connectivity_tx, connectivity_rx) = mpsc::channel(16);
    let handle = coordinator.start_with_connectivity(connectivity_rx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status_ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
    status_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("interrupt received; shutting down");
                break;
            }
            _ = status_ticker.tick() => {
                let status = coordinator.status().await;
                tracing::info!(
                    online = status.online,
                    running = status.running,
                    queued = status.queued_count,
                    unsynced_actions = status.unsynced_offline_action_count,
                    permanent_failures = status.permanent_failure_count_since_clear,
                    "sync status"
                );
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&coordinator, &connectivity_tx, &line).await,
                Ok(None) => {
                    tracing::info!("stdin closed; shutting down");
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to read stdin; shutting down");
                    break;
                }
            },
        }
    }

    handle.shutdown().await;
    coordinator.wait_idle().await;
    Ok(())
}

async fn handle_line(
    coordinator: &SyncCoordinator,
    connectivity: &mpsc::Sender<ConnectivityEvent>,
    line: &str,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<AgentCommand>(line) {
        Ok(AgentCommand::Connectivity { online }) => {
            let event = if online {
                ConnectivityEvent::BecameOnline
            } else {
                ConnectivityEvent::BecameOffline
            };
            if connectivity.send(event).await.is_err() {
                tracing::warn!("sync loop is gone; connectivity update dropped");
            }
        }
        Ok(AgentCommand::Enqueue(request)) => {
            let id = coordinator.enqueue(request).await;
            println!("{}", serde_json::json!({ "queued": id }));
        }
        Err(err) => tracing::warn!(error = %err, "ignoring malformed input line"),
    }
}
