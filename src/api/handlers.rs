use std::collections::BTreeMap;
use std::io;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogSnapshot;
use crate::hub::{Hub, HubError};
use crate::machine::validate_identifier;
use crate::protocol::Frame;
use crate::session::Client;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(super) async fn not_found() -> ApiError {
    ApiError::NotFound
}

pub(super) async fn ws_frontend(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_frontend(socket, state))
}

async fn handle_frontend(socket: WebSocket, state: AppState) {
    let hub = &state.hub;
    let (conn, mut outbound) = hub.outbox().attach();
    let client = hub.on_frontend_connect(conn);
    tracing::info!(%conn, "front-end attached");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            // Hub -> front-end
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if ws_tx.send(Message::Binary(frame.encode())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Front-end -> hub
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => handle_message(hub, &client, &data),
                    Some(Ok(Message::Text(_))) => {
                        let err = HubError::MalformedFrame(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "text messages are not accepted",
                        ));
                        hub.report_error(conn, &err);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(_)) => break,
                }
            }

            _ = state.shutdown.cancelled() => {
                tracing::debug!(%conn, "front-end socket received shutdown signal, closing");
                let close_frame = CloseFrame {
                    code: axum::extract::ws::close_code::AWAY,
                    reason: "hub shutting down".into(),
                };
                let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                let _ = ws_tx.flush().await;
                break;
            }
        }
    }

    hub.on_frontend_disconnect(conn);
    hub.outbox().detach(conn);
    tracing::info!(%conn, "front-end detached");
}

/// Decode and dispatch one binary message. Failures are reported back on the
/// same connection, which stays open.
fn handle_message(hub: &Hub, client: &Client, data: &[u8]) {
    let result = Frame::decode(data)
        .map_err(HubError::from)
        .and_then(|frame| hub.handle_frontend_frame(client, frame));
    if let Err(e) = result {
        tracing::debug!(conn = %client.conn(), error = %e, "front-end frame rejected");
        hub.report_error(client.conn(), &e);
    }
}

pub(super) async fn list_actions(State(state): State<AppState>) -> Json<CatalogSnapshot> {
    Json(state.hub.catalog().snapshot().as_ref().clone())
}

pub(super) async fn list_machines(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, Vec<String>>> {
    Json(state.hub.machines().overview())
}

#[derive(Serialize)]
pub(super) struct ActiveResponse {
    action: String,
    active: usize,
}

pub(super) async fn action_active(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ActiveResponse>, ApiError> {
    validate_identifier("action", &name).map_err(ApiError::InvalidName)?;
    let active = state.hub.active_count(&name);
    Ok(Json(ActiveResponse {
        action: name,
        active,
    }))
}

#[derive(Serialize)]
pub(super) struct CancelResponse {
    action: String,
    cancelled: usize,
}

pub(super) async fn cancel_action(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    validate_identifier("action", &name).map_err(ApiError::InvalidName)?;
    let cancelled = state.hub.cancel_action(&name);
    tracing::info!(action = %name, cancelled, "action cancelled via admin API");
    Ok(Json(CancelResponse {
        action: name,
        cancelled,
    }))
}

#[derive(Deserialize)]
pub(super) struct BroadcastRequest {
    header: String,
    #[serde(default)]
    body: String,
}

#[derive(Serialize)]
pub(super) struct BroadcastResponse {
    delivered: usize,
    failed: usize,
}

pub(super) async fn broadcast(
    State(state): State<AppState>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, ApiError> {
    if req.header.is_empty() {
        return Err(ApiError::InvalidRequest("header must not be empty".into()));
    }
    let report = state
        .hub
        .broadcast_to_frontends(&req.header, req.body.as_bytes());
    Ok(Json(BroadcastResponse {
        delivered: report.delivered,
        failed: report.failed.len(),
    }))
}
