//! Minimal operational HTTP surface: `/health`, `/ready`, `/metrics`.
//!
//! Metrics exposition is delegated through [`MetricsRenderer`] so the
//! prometheus dependency stays in the `drover-prometheus` companion crate.

use crate::runtime::Runtime;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

/// Renders the current metric values in Prometheus text exposition format.
pub trait MetricsRenderer: Send + Sync {
    fn render(&self) -> String;
}

pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(runtime)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    addr: std::net::SocketAddr,
    runtime: Arc<Runtime>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| crate::error::Error::invalid_config(format!("cannot bind {addr}: {err}")))?;
    tracing::info!(%addr, "ops endpoint listening");
    axum::serve(listener, router(runtime))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| crate::error::Error::internal(format!("http server failed: {err}")))
}

async fn health(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    match runtime.health().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    }
}

async fn ready(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    if runtime.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    match runtime.metrics_renderer() {
        Some(renderer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            renderer.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "no metrics renderer registered; wire one from drover-prometheus",
        )
            .into_response(),
    }
}
