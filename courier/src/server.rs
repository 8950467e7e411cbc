//! WebSocket handshake layer
//!
//! Thin connection-layer collaborator around the registry: it validates
//! the caller identity, upgrades the connection, registers the session,
//! pumps registry payloads out as JSON text frames, and removes the
//! session when the read loop ends.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

use courier_relay::{Audience, ConnectionRegistry};

/// Cap on inbound frame size; clients only ever send control traffic.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
}

/// Query parameters for WebSocket connections
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(user_ws_handler))
        .route("/ws/admin", get(admin_ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// User WebSocket endpoint: `GET /ws?user_id={identity}`
async fn user_ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(identity) = query.user_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "user_id is required").into_response();
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, Audience::User, identity))
        .into_response()
}

/// Admin WebSocket endpoint: `GET /ws/admin?user_id={identity}`
///
/// The identity is optional here; without one the remote address serves
/// as a fallback.
async fn admin_ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = admin_identity(query.user_id, &addr);

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, Audience::Admin, identity))
        .into_response()
}

fn admin_identity(query_id: Option<String>, addr: &SocketAddr) -> String {
    query_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("admin_{}", addr.ip()))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    audience: Audience,
    identity: String,
) {
    let mut payload_rx = state.registry.register(audience, &identity);
    let (mut sink, mut stream) = socket.split();

    info!(identity = %identity, audience = ?audience, "WebSocket connected");

    // Tracks whether this task still owns the registry entry; a newer
    // session with the same identity takes it over.
    let mut replaced = false;

    loop {
        tokio::select! {
            payload = payload_rx.recv() => match payload {
                Some(payload) => {
                    if sink.send(Message::Text(payload.to_json().into())).await.is_err() {
                        debug!(identity = %identity, "WebSocket write failed");
                        break;
                    }
                }
                None => {
                    // Channel closed: a newer registration displaced
                    // this session. Its registry entry is not ours to
                    // remove anymore.
                    replaced = true;
                    break;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(identity = %identity, error = %e, "WebSocket read error");
                    break;
                }
                // Inbound frames carry nothing this service consumes.
                Some(Ok(_)) => {}
            },
        }
    }

    if !replaced {
        state.registry.remove(audience, &identity);
    }
    info!(identity = %identity, audience = ?audience, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_identity_prefers_query_param() {
        let addr: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        assert_eq!(
            admin_identity(Some("ops-1".to_string()), &addr),
            "ops-1"
        );
    }

    #[test]
    fn test_admin_identity_falls_back_to_address() {
        let addr: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        assert_eq!(admin_identity(None, &addr), "admin_10.1.2.3");
        assert_eq!(admin_identity(Some(String::new()), &addr), "admin_10.1.2.3");
    }
}
