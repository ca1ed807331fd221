//! Logging initialization and the metrics/health HTTP endpoint.
//!
//! Tracing stays in the runner: the state machine only emits spans and
//! events, never configures where they go.

use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
}

/// Configuration for telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to startup logs.
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Enable Prometheus metrics endpoint.
    pub prometheus_enabled: bool,
    /// Prometheus metrics port.
    pub prometheus_port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "blockmania-node".to_string(),
            default_filter: "info,blockmania=debug".to_string(),
            json: false,
            prometheus_enabled: false,
            prometheus_port: 9090,
        }
    }
}

/// Initialize logging and, if enabled, the metrics endpoint.
///
/// `RUST_LOG` overrides [`TelemetryConfig::default_filter`].
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.default_filter)?,
    };

    let (json_layer, text_layer) = if config.json {
        (
            Some(tracing_subscriber::fmt::layer().json().with_target(true)),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true),
            ),
        )
    };

    let subscriber = Registry::default()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer);

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        "Telemetry initialized"
    );

    let (prometheus_handle, ready_flag) = if config.prometheus_enabled {
        let ready_flag = Arc::new(AtomicBool::new(false));
        let handle = start_metrics_server(config.prometheus_port, ready_flag.clone());
        (Some(handle), Some(ready_flag))
    } else {
        (None, None)
    };

    Ok(TelemetryGuard {
        prometheus_handle,
        ready_flag,
    })
}

/// Guard that stops the metrics server on drop.
pub struct TelemetryGuard {
    prometheus_handle: Option<tokio::task::JoinHandle<()>>,
    ready_flag: Option<Arc<AtomicBool>>,
}

impl TelemetryGuard {
    /// Stop the metrics server.
    pub fn shutdown(mut self) {
        if let Some(handle) = self.prometheus_handle.take() {
            handle.abort();
        }
    }

    /// Mark the node as ready (for readiness checks).
    ///
    /// Call this once every runner has been started.
    pub fn set_ready(&self, ready: bool) {
        if let Some(flag) = &self.ready_flag {
            flag.store(ready, Ordering::SeqCst);
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.prometheus_handle.take() {
            handle.abort();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Prometheus HTTP Server
// ═══════════════════════════════════════════════════════════════════════════

fn router(ready_flag: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(ready_flag.clone())))
}

/// Start the metrics HTTP server.
///
/// Exposes:
/// - `GET /metrics` - Prometheus metrics in text format
/// - `GET /health` - Liveness check (always returns 200 if server is running)
/// - `GET /ready` - Readiness check (returns 200 if node is ready, 503 otherwise)
fn start_metrics_server(port: u16, ready_flag: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(ready_flag);

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tracing::info!(port, "Starting metrics server on http://{}", addr);

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = ?e, port, "Failed to bind metrics server");
                return;
            }
        };

        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "Metrics server error");
        }
    })
}

/// Handler for `/metrics` - returns Prometheus metrics.
async fn metrics_handler() -> impl axum::response::IntoResponse {
    // Registers the engine metrics so the first scrape is not empty.
    let _ = crate::metrics::metrics();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = ?e, "Failed to encode metrics");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    (
        [(
            axum::http::header::CONTENT_TYPE,
            encoder.format_type().to_string(),
        )],
        buffer,
    )
        .into_response()
}

/// Handler for `/health` - liveness check.
async fn health_handler() -> impl axum::response::IntoResponse {
    axum::Json(HealthResponse { status: "ok" })
}

/// Handler for `/ready` - readiness check.
async fn ready_handler(ready_flag: Arc<AtomicBool>) -> impl axum::response::IntoResponse {
    if ready_flag.load(Ordering::SeqCst) {
        (
            axum::http::StatusCode::OK,
            axum::Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(ReadyResponse {
                status: "not_ready",
                ready: false,
            }),
        )
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (axum::http::StatusCode, serde_json::Value) {
        let request = axum::http::Request::builder()
            .uri(uri)
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "blockmania-node");
        assert!(!config.json);
        assert!(!config.prometheus_enabled);
        assert_eq!(config.prometheus_port, 9090);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(Arc::new(AtomicBool::new(false)));
        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_endpoint_follows_flag() {
        let flag = Arc::new(AtomicBool::new(false));

        let (status, json) = get_json(router(flag.clone()), "/ready").await;
        assert_eq!(status, axum::http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["ready"], false);

        flag.store(true, Ordering::SeqCst);
        let (status, json) = get_json(router(flag), "/ready").await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(json["status"], "ready");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_engine_metrics() {
        let app = router(Arc::new(AtomicBool::new(true)));
        let request = axum::http::Request::builder()
            .uri("/metrics")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = std::str::from_utf8(&body).expect("Metrics should be valid UTF-8");
        assert!(text.contains("blockmania_entries_committed_total"));
    }

    #[test]
    fn test_set_ready_flag() {
        let ready_flag = Arc::new(AtomicBool::new(false));
        let guard = TelemetryGuard {
            prometheus_handle: None,
            ready_flag: Some(ready_flag.clone()),
        };

        guard.set_ready(true);
        assert!(ready_flag.load(Ordering::SeqCst));
        guard.set_ready(false);
        assert!(!ready_flag.load(Ordering::SeqCst));
    }
}
