//! Companion Service Notifications
//!
//! Best-effort HTTP calls to the line's companion backend:
//! - `POST {backend}/api/ingest/gate/reset` with `{gate, timestamp}` after a
//!   non-reject batch completes
//! - `POST {backend}/api/ingest/reload-assignments` after a gate map is
//!   activated
//!
//! Notifications never block aggregation. [`dispatch`] spawns one detached
//! task per notification and failures are only logged.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::defaults::COMPANION_SECRET_HEADER;
use crate::config::CompanionConfig;
use crate::lifecycle::Notification;
use crate::types::Gate;

/// Companion client errors
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server returned status {0}")]
    ServerError(reqwest::StatusCode),
}

/// Receiver of lifecycle side effects.
#[async_trait]
pub trait CompanionNotifier: Send + Sync {
    async fn gate_reset(&self, gate: Gate, timestamp: DateTime<Utc>) -> Result<(), CompanionError>;

    async fn reload_assignments(&self) -> Result<(), CompanionError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Serialize)]
struct GateResetBody {
    gate: Gate,
    timestamp: DateTime<Utc>,
}

/// HTTP client for the companion backend
#[derive(Clone)]
pub struct CompanionClient {
    http: reqwest::Client,
    backend_url: String,
    shared_secret: Option<String>,
}

impl CompanionClient {
    pub fn new(config: &CompanionConfig) -> Result<Self, CompanionError> {
        let http = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            http,
            backend_url: config.backend_url.trim_end_matches('/').to_string(),
            shared_secret: config.shared_secret.clone(),
        })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), CompanionError> {
        let mut req = self
            .http
            .post(format!("{}{}", self.backend_url, path))
            .json(body);
        if let Some(secret) = &self.shared_secret {
            req = req.header(COMPANION_SECRET_HEADER, secret);
        }
        let resp = req.send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CompanionError::ServerError(resp.status()))
        }
    }
}

#[async_trait]
impl CompanionNotifier for CompanionClient {
    async fn gate_reset(&self, gate: Gate, timestamp: DateTime<Utc>) -> Result<(), CompanionError> {
        self.post("/api/ingest/gate/reset", &GateResetBody { gate, timestamp })
            .await
    }

    async fn reload_assignments(&self) -> Result<(), CompanionError> {
        self.post("/api/ingest/reload-assignments", &serde_json::json!({}))
            .await
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Notifier used when the companion service is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl CompanionNotifier for DisabledNotifier {
    async fn gate_reset(&self, _gate: Gate, _timestamp: DateTime<Utc>) -> Result<(), CompanionError> {
        Ok(())
    }

    async fn reload_assignments(&self) -> Result<(), CompanionError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Build the notifier selected by `config`.
pub fn notifier_from_config(config: &CompanionConfig) -> Result<Arc<dyn CompanionNotifier>, CompanionError> {
    if config.enabled {
        Ok(Arc::new(CompanionClient::new(config)?))
    } else {
        Ok(Arc::new(DisabledNotifier))
    }
}

/// Send notifications as detached tasks. Must be called inside a Tokio runtime.
pub fn dispatch(notifier: &Arc<dyn CompanionNotifier>, notifications: Vec<Notification>) {
    for notification in notifications {
        let notifier = Arc::clone(notifier);
        tokio::spawn(async move {
            let result = match &notification {
                Notification::GateReset { gate, timestamp } => notifier.gate_reset(*gate, *timestamp).await,
                Notification::ReloadAssignments => notifier.reload_assignments().await,
            };
            match result {
                Ok(()) => debug!(notifier = notifier.name(), ?notification, "[Companion] Delivered"),
                Err(e) => warn!(notifier = notifier.name(), ?notification, "[Companion] Notification failed: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(url: String) -> CompanionConfig {
        CompanionConfig {
            enabled: true,
            backend_url: url,
            shared_secret: Some("line-7".to_string()),
            timeout_ms: 1000,
        }
    }

    /// Accept one connection, capture the raw request and reply with `status`.
    async fn one_shot_server(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let reply = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_gate_reset_posts_json_with_secret() {
        let (url, server) = one_shot_server("200 OK").await;
        let client = CompanionClient::new(&config(url)).unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();
        client.gate_reset(4, ts).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/ingest/gate/reset "), "{request}");
        assert!(request.to_ascii_lowercase().contains("x-plc-secret: line-7"));
        assert!(request.contains(r#""gate":4"#));
        assert!(request.contains("2025-05-01T08:00:00Z"));
    }

    #[tokio::test]
    async fn test_server_error_status_reported() {
        let (url, server) = one_shot_server("500 Internal Server Error").await;
        let client = CompanionClient::new(&config(format!("{url}/"))).unwrap();
        let err = client.reload_assignments().await.unwrap_err();
        assert!(matches!(err, CompanionError::ServerError(s) if s.as_u16() == 500));
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/ingest/reload-assignments "), "{request}");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_http_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = CompanionClient::new(&config(format!("http://{addr}"))).unwrap();
        assert!(matches!(client.reload_assignments().await, Err(CompanionError::Http(_))));
    }

    #[test]
    fn test_disabled_notifier_is_noop() {
        let mut cfg = config(String::new());
        cfg.enabled = false;
        let notifier = notifier_from_config(&cfg).unwrap();
        assert_eq!(notifier.name(), "disabled");
        tokio_test::block_on(async {
            assert!(notifier.reload_assignments().await.is_ok());
        });
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl CompanionNotifier for Counting {
        async fn gate_reset(&self, _gate: Gate, _timestamp: DateTime<Utc>) -> Result<(), CompanionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reload_assignments(&self) -> Result<(), CompanionError> {
            self.0.fetch_add(10, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_dispatch_delivers_each_notification() {
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let notifier: Arc<dyn CompanionNotifier> = counter.clone();
        dispatch(
            &notifier,
            vec![
                Notification::GateReset { gate: 1, timestamp: Utc::now() },
                Notification::GateReset { gate: 2, timestamp: Utc::now() },
                Notification::ReloadAssignments,
            ],
        );
        for _ in 0..50 {
            if counter.0.load(Ordering::SeqCst) == 12 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 12);
    }
}
