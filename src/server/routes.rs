//! HTTP routes
//!
//! `/` answers plain requests with a health line. A WebSocket upgrade is
//! accepted on any path; everything else is a 404.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::websocket::handle_socket;
use crate::config::TransportConfig;
use crate::relay::Router;

/// Body of the health check response
pub const HEALTH_BODY: &str = "WebSocket server is running";

/// Shared state handed to every request
#[derive(Clone)]
pub(super) struct AppState {
    pub router: Arc<Router>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub transport: TransportConfig,
    /// Held by every live connection task; shutdown waits for all clones
    /// to drop
    pub drain: mpsc::Sender<()>,
}

type Upgrade = Result<WebSocketUpgrade, WebSocketUpgradeRejection>;

/// Build the axum router
pub(super) fn build_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/", any(root_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

async fn root_handler(
    upgrade: Upgrade,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    match upgrade {
        Ok(ws) => accept(ws, peer_addr, state),
        Err(_) => ([(header::CONTENT_TYPE, "text/plain")], HEALTH_BODY).into_response(),
    }
}

async fn fallback_handler(
    uri: Uri,
    upgrade: Upgrade,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    match upgrade {
        Ok(ws) => accept(ws, peer_addr, state),
        Err(_) => {
            debug!("No route for {} from {}", uri, peer_addr);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

fn accept(ws: WebSocketUpgrade, peer_addr: SocketAddr, state: AppState) -> Response {
    debug!("New connection from {}", peer_addr);
    ws.on_upgrade(move |socket| handle_socket(socket, peer_addr, state))
}
