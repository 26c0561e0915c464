//! Metrics exposition listener
//!
//! Optional listener serving the registry in text exposition format on
//! `/metrics`, plus a trivial `/health` probe endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::Metrics;

/// Serve `/metrics` and `/health` on `addr` until the cancellation token
/// fires.
pub async fn start_metrics_server(
    metrics: Arc<Metrics>,
    addr: SocketAddr,
    cancel_token: CancellationToken,
) -> Result<(), anyhow::Error> {
    let router = Router::new()
        .route("/metrics", get(exposition))
        .route("/health", get(|| async { "ok" }))
        .with_state(metrics);

    let listener = TcpListener::bind(addr).await?;
    debug!(%addr, "metrics listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(cancel_token.cancelled_owned())
        .await?;
    debug!("metrics listener stopped");

    Ok(())
}

async fn exposition(State(metrics): State<Arc<Metrics>>) -> Result<impl IntoResponse, StatusCode> {
    let body = metrics.render_text().map_err(|e| {
        error!(err = %e, "metrics encoding failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}
