//! Registration endpoint for connector tunnel sockets.
//!
//! # Responsibilities
//! - Validate the registration handshake (route, component, source IP)
//! - Negotiate the protocol version via WebSocket subprotocols
//! - Run each accepted socket's read loop and write task
//!
//! # Data Flow
//! ```text
//! connector ──▶ GET /register (upgrade, x-tunnel-route/-component,
//!               Sec-WebSocket-Protocol: tunnel-v2, tunnel-v1)
//!     ──▶ policy + version checks ──▶ 101 with chosen subprotocol
//!     ──▶ TunnelSocket added to registry ──▶ frames flow
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::observability::metrics;
use crate::protocol::frames::{WireMessage, WriteCmd};
use crate::protocol::version::{negotiate, parse_offered};
use crate::protocol::{codec_for, CodecSide, ProtocolVersion};
use crate::protocol::{COMPONENT_HEADER, ROUTE_HEADER};
use crate::router::registry::RouterRegistry;
use crate::router::socket::TunnelSocket;

/// Depth of the write queue feeding each socket's transport.
const WRITE_QUEUE_DEPTH: usize = 64;

/// State shared by the registration endpoint.
#[derive(Clone)]
pub struct RegistrationState {
    pub registry: Arc<RouterRegistry>,
    pub supported_versions: Vec<ProtocolVersion>,
    pub window_size: usize,
}

/// `GET /register` upgrade handler.
pub async fn registration_handler(
    State(state): State<RegistrationState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(route) = header_value(&headers, ROUTE_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing x-tunnel-route header").into_response();
    };
    let Some(component) = header_value(&headers, COMPONENT_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing x-tunnel-component header").into_response();
    };

    if let Err(e) = state.registry.validate_registration(addr.ip(), &route) {
        tracing::warn!(route = %route, peer = %addr, error = %e, "Registration rejected");
        return (StatusCode::FORBIDDEN, e.to_string()).into_response();
    }

    let offered = header_value(&headers, "sec-websocket-protocol")
        .map(|h| parse_offered(&h))
        .unwrap_or_default();
    let version = match negotiate(&state.supported_versions, &offered) {
        Ok(version) => version,
        Err(e) => {
            metrics::record_registration("version_mismatch");
            tracing::warn!(route = %route, peer = %addr, error = %e, "Registration rejected");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    ws.protocols([version.subprotocol()])
        .on_upgrade(move |socket| {
            run_socket(state, socket, addr, route, component, version)
        })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Drive one accepted tunnel socket until its transport ends.
async fn run_socket(
    state: RegistrationState,
    transport: WebSocket,
    peer: SocketAddr,
    route: String,
    component: String,
    version: ProtocolVersion,
) {
    let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let socket = Arc::new(TunnelSocket::new(
        route,
        component,
        version,
        codec_for(version, CodecSide::Router),
        state.window_size,
        writer_tx,
    ));

    if let Err(e) = state.registry.register(socket.clone(), peer.ip()) {
        tracing::warn!(peer = %peer, error = %e, "Post-upgrade registration failed");
        return;
    }

    let (ws_tx, mut ws_rx) = transport.split();
    let write_task = tokio::spawn(run_write_task(ws_tx, writer_rx));

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                socket.dispatch_wire(WireMessage::Text(text.to_string())).await;
            }
            Ok(Message::Binary(data)) => {
                socket.dispatch_wire(WireMessage::Binary(data.to_vec())).await;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => socket.touch(),
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(socket_id = %socket.id, error = %e, "Tunnel transport error");
                break;
            }
        }
    }

    socket.mark_closed();
    state.registry.deregister(&socket, socket.close_cause());
    write_task.abort();
}

async fn run_write_task(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut writer_rx: mpsc::Receiver<WriteCmd>,
) {
    while let Some(cmd) = writer_rx.recv().await {
        match cmd {
            WriteCmd::Frame(WireMessage::Text(text)) => {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            WriteCmd::Frame(WireMessage::Binary(data)) => {
                if ws_tx.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            WriteCmd::Shutdown => break,
        }
    }
    let _ = ws_tx.close().await;
}
