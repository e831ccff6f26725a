//! Diagnostics listener
//!
//! A second, normally loopback-only HTTP listener exposing a status page at
//! `/` and Prometheus metrics at `/metrics`.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::debug;

use crate::config::DiagnosticsConfig;
use crate::metrics::MetricsRegistry;

pub fn router(metrics: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn index_handler(State(metrics): State<Arc<MetricsRegistry>>) -> Response {
    Json(serde_json::json!({
        "name": crate::NAME,
        "version": crate::VERSION,
        "uptime_secs": metrics.uptime_secs(),
    }))
    .into_response()
}

async fn metrics_handler(State(metrics): State<Arc<MetricsRegistry>>) -> Response {
    let mut resp = Response::new(metrics.export_prometheus().into());
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    resp
}

/// Run the diagnostics listener until the process exits.
pub async fn run(cfg: &DiagnosticsConfig, metrics: Arc<MetricsRegistry>) -> Result<()> {
    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("failed to bind diagnostics listener on {}", cfg.listen))?;
    debug!("Diagnostics http server listening on {}", cfg.listen);
    axum::serve(listener, router(metrics))
        .await
        .context("diagnostics server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_index_reports_name_and_version() {
        let app = router(Arc::new(MetricsRegistry::new()));
        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["name"], "pavonis");
        assert!(json["version"].is_string());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = Arc::new(MetricsRegistry::new());
        metrics.record_request(502);
        let app = router(metrics);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("pavonis_server_http_request_total{code=\"502\"} 1"));
    }
}
