//! HTTP surface of the hub: the front-end WebSocket endpoint and a small set
//! of admin routes.

pub mod error;
mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::hub::Hub;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    /// Fired on shutdown; open front-end sockets close when it does.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_frontend))
        .route("/actions", get(list_actions))
        .route("/actions/{name}/active", get(action_active))
        .route("/actions/{name}/cancel", post(cancel_action))
        .route("/machines", get(list_machines))
        .route("/broadcast", post(broadcast))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
