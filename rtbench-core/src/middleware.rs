use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

/// One debug line per inbound request. Gated by the subscriber level, so it
/// costs nothing unless `--debug` is set.
pub async fn debug_log(req: Request, next: Next) -> Response {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_default();
    debug!(
        remote_addr = %remote,
        method = %req.method(),
        path = %req.uri().path(),
        "received request"
    );
    next.run(req).await
}
