//! The inbound proxy listener

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::handler::{handle_proxy_request, ProxyState};

/// Serve the proxy on `addr` until the cancellation token fires.
///
/// Every method and path lands in the proxy handler; there are no other
/// routes on this listener.
pub async fn start_proxy_server(
    state: Arc<ProxyState>,
    addr: SocketAddr,
    cancel_token: tokio_util::sync::CancellationToken,
) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Listening");
    serve(state, listener, cancel_token).await
}

/// Serve the proxy on an already-bound listener.
pub async fn serve(
    state: Arc<ProxyState>,
    listener: TcpListener,
    cancel_token: tokio_util::sync::CancellationToken,
) -> Result<(), anyhow::Error> {
    let app = Router::new()
        .fallback(handle_proxy_request)
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
            debug!("Proxy server shutting down");
        })
        .await?;

    Ok(())
}
