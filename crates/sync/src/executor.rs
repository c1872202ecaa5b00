//! Delivery executor: one network attempt per item, classified.

use std::sync::Arc;
use std::time::Duration;

use offsync_infra::{HttpMethod, Transport, TransportError, TransportRequest};
use serde::de::DeserializeOwned;

use crate::backoff::BackoffPolicy;
use crate::error::DeliveryFailure;
use crate::types::SyncQueueItem;

/// Supplies the current bearer token, if any. Called once per attempt.
pub type TokenAccessor = Arc<dyn Fn() -> Option<String> + Send + Sync>;

const MAX_REJECTED_BODY_CHARS: usize = 512;

/// Body of a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBody {
    pub status: u16,
    pub bytes: Vec<u8>,
}

impl ResponseBody {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.bytes)
    }
}

/// Classified result of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Success(ResponseBody),
    Failure {
        failure: DeliveryFailure,
        /// How long the item should wait before its next attempt.
        retry_after: Duration,
    },
}

/// Issues exactly one request per [`DeliveryExecutor::attempt`]. Never retries.
#[derive(Clone)]
pub struct DeliveryExecutor {
    transport: Arc<dyn Transport>,
    base_url: String,
    token: Option<TokenAccessor>,
    backoff: BackoffPolicy,
    attempt_timeout: Duration,
}

impl std::fmt::Debug for DeliveryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryExecutor")
            .field("base_url", &self.base_url)
            .field("has_token", &self.token.is_some())
            .field("backoff", &self.backoff)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

impl DeliveryExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
        backoff: BackoffPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            token: None,
            backoff,
            attempt_timeout,
        }
    }

    pub fn with_token(mut self, token: Option<TokenAccessor>) -> Self {
        self.token = token;
        self
    }

    /// Join the base URL with `endpoint`. Absolute endpoints pass through.
    pub fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }

        let base = self.base_url.trim_end_matches('/');
        let path = endpoint.trim_start_matches('/');
        if path.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{path}")
        }
    }

    pub fn build_request(&self, item: &SyncQueueItem) -> Result<TransportRequest, serde_json::Error> {
        let mut request = TransportRequest::new(item.target.method, self.url_for(&item.target.endpoint))
            .header("accept", "application/json");

        if item.target.method != HttpMethod::Get {
            request = request
                .header("content-type", "application/json")
                .body(serde_json::to_vec(&item.payload)?);
        }

        if let Some(token) = self.token.as_ref().and_then(|t| t()) {
            request = request.header("authorization", format!("Bearer {token}"));
        }

        Ok(request)
    }

    /// Attempt delivery of `item` once.
    pub async fn attempt(&self, item: &SyncQueueItem) -> DeliveryOutcome {
        let retry_after = self.backoff.delay_for(item.attempt_count.saturating_add(1));

        let request = match self.build_request(item) {
            Ok(request) => request,
            Err(err) => {
                return DeliveryOutcome::Failure {
                    failure: DeliveryFailure::Transport(TransportError::Other(format!(
                        "failed to encode payload: {err}"
                    ))),
                    retry_after,
                };
            }
        };

        tracing::debug!(
            item_id = %item.id,
            kind = %item.kind,
            method = %request.method,
            url = %request.url,
            attempt = item.attempt_count + 1,
            "attempting delivery"
        );

        let response = match tokio::time::timeout(self.attempt_timeout, self.transport.send(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return DeliveryOutcome::Failure {
                    failure: DeliveryFailure::Transport(err),
                    retry_after,
                };
            }
            Err(_) => {
                return DeliveryOutcome::Failure {
                    failure: DeliveryFailure::Transport(TransportError::Timeout(self.attempt_timeout)),
                    retry_after,
                };
            }
        };

        if response.is_success() {
            DeliveryOutcome::Success(ResponseBody {
                status: response.status,
                bytes: response.body,
            })
        } else {
            DeliveryOutcome::Failure {
                failure: DeliveryFailure::Rejected {
                    status: response.status,
                    body: truncate(&String::from_utf8_lossy(&response.body)),
                },
                retry_after,
            }
        }
    }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_REJECTED_BODY_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SyncQueue;
    use crate::types::{EnqueueRequest, SyncKind, SyncTarget};
    use async_trait::async_trait;
    use chrono::Utc;
    use offsync_infra::TransportResponse;
    use serde_json::json;
    use std::sync::Mutex;

    struct FixedTransport {
        reply: Result<TransportResponse, TransportError>,
        delay: Duration,
        seen: Mutex<Vec<TransportRequest>>,
    }

    impl FixedTransport {
        fn new(reply: Result<TransportResponse, TransportError>) -> Self {
            Self {
                reply,
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for FixedTransport {
        async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reply.clone()
        }
    }

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300), Duration::ZERO)
    }

    fn item(endpoint: &str) -> SyncQueueItem {
        let mut queue = SyncQueue::new();
        let id = queue.admit(
            EnqueueRequest::new(
                SyncKind::UserDataUpdate,
                json!({"name": "Ada"}),
                SyncTarget::put(endpoint),
            ),
            3,
            Utc::now(),
        );
        queue.get(id).unwrap().clone()
    }

    fn executor(transport: Arc<FixedTransport>) -> DeliveryExecutor {
        DeliveryExecutor::new(transport, "https://api.example.test/", no_jitter(), Duration::from_secs(5))
    }

    #[test]
    fn joins_base_url_and_endpoint() {
        let exec = executor(Arc::new(FixedTransport::new(Ok(TransportResponse::new(200, "")))));

        assert_eq!(exec.url_for("/users/me"), "https://api.example.test/users/me");
        assert_eq!(exec.url_for("users/me"), "https://api.example.test/users/me");
        assert_eq!(exec.url_for("http://other.test/x"), "http://other.test/x");
    }

    #[tokio::test]
    async fn success_carries_the_body_and_headers_are_set() {
        let transport = Arc::new(FixedTransport::new(Ok(TransportResponse::new(201, r#"{"ok":true}"#))));
        let exec = executor(transport.clone()).with_token(Some(Arc::new(|| Some("t0k".to_string()))));

        let outcome = exec.attempt(&item("/users/me")).await;

        match outcome {
            DeliveryOutcome::Success(body) => {
                assert_eq!(body.status, 201);
                assert_eq!(body.json::<serde_json::Value>().unwrap(), json!({"ok": true}));
            }
            other => panic!("expected success, got {other:?}"),
        }

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].method, HttpMethod::Put);
        assert_eq!(seen[0].header_value("Authorization"), Some("Bearer t0k"));
        assert_eq!(seen[0].header_value("content-type"), Some("application/json"));
        assert_eq!(seen[0].body.as_deref(), Some(br#"{"name":"Ada"}"#.as_slice()));
    }

    #[tokio::test]
    async fn no_token_means_no_authorization_header() {
        let transport = Arc::new(FixedTransport::new(Ok(TransportResponse::new(200, ""))));
        let exec = executor(transport.clone()).with_token(Some(Arc::new(|| None)));

        exec.attempt(&item("/users/me")).await;

        assert!(transport.seen.lock().unwrap()[0].header_value("authorization").is_none());
    }

    #[tokio::test]
    async fn non_2xx_is_rejected_with_backoff() {
        let transport = Arc::new(FixedTransport::new(Ok(TransportResponse::new(503, "busy"))));
        let exec = executor(transport);

        let mut it = item("/users/me");
        it.attempt_count = 2;

        assert_eq!(
            exec.attempt(&it).await,
            DeliveryOutcome::Failure {
                failure: DeliveryFailure::Rejected {
                    status: 503,
                    body: "busy".to_string()
                },
                retry_after: Duration::from_secs(4),
            }
        );
    }

    #[tokio::test]
    async fn transport_errors_are_failures() {
        let transport = Arc::new(FixedTransport::new(Err(TransportError::Connect("refused".into()))));
        let exec = executor(transport);

        match exec.attempt(&item("/users/me")).await {
            DeliveryOutcome::Failure { failure, retry_after } => {
                assert_eq!(failure, DeliveryFailure::Transport(TransportError::Connect("refused".into())));
                assert_eq!(retry_after, Duration::from_secs(1));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_is_a_timeout() {
        let mut transport = FixedTransport::new(Ok(TransportResponse::new(200, "")));
        transport.delay = Duration::from_secs(60);
        let exec = executor(Arc::new(transport));

        match exec.attempt(&item("/users/me")).await {
            DeliveryOutcome::Failure { failure, .. } => {
                assert_eq!(
                    failure,
                    DeliveryFailure::Transport(TransportError::Timeout(Duration::from_secs(5)))
                );
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn long_rejection_bodies_are_truncated() {
        let long = "x".repeat(2000);
        let out = truncate(&long);
        assert_eq!(out.len(), MAX_REJECTED_BODY_CHARS + 3);
        assert!(out.ends_with("..."));
    }
}
