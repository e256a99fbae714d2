//! HTTP API server.
//!
//! One route: every path and method lands on [`handler::handle`], which only
//! accepts POST. Built on Axum, with requests traced by tower-http.

use axum::Router;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::{error::Result, proxy::RequestProxy, tracing::prelude::*};

pub mod handler;

pub use handler::ProxyError;

/// Listen on all interfaces. No TLS and no authentication; only expose this
/// to a trusted network.
pub const LISTEN_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
    3434,
);

/// Build the router around a proxy.
pub fn router(proxy: Arc<RequestProxy>) -> Router {
    Router::new()
        .fallback(handler::handle)
        .layer(TraceLayer::new_for_http())
        .with_state(proxy)
}

/// Serve on `listener` until `shutdown` is cancelled.
///
/// In-flight requests are allowed to finish before this returns.
pub async fn serve(
    listener: TcpListener,
    proxy: Arc<RequestProxy>,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening for Notecard requests");
    }

    axum::serve(listener, router(proxy))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    debug!("HTTP server stopped");
    Ok(())
}
