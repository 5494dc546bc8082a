//! Exchange dispatch over tunnel sockets.
//!
//! # Responsibilities
//! - Select a tunnel socket for a route (fewest in-flight, then
//!   least-recently-used, skipping sockets at their window ceiling)
//! - Relay one HTTP exchange: request head + streamed body out, streamed
//!   response back, chunk boundaries preserved
//! - Relay WebSocket pass-through exchanges frame by frame
//! - Surface `TunnelBroken` when the socket dies mid-exchange; no silent
//!   retry on another socket, partial state may already be visible
//!
//! # Data Flow
//! ```text
//! client request ──▶ snapshot(route) ──▶ socket selection ──▶ window slot
//!     ──▶ ReqHead/ReqBody/ReqEnd frames ──▶ tunnel
//! tunnel ──▶ RspHead ──▶ response head ──▶ RspBody stream ──▶ client
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket};
use axum::http::{request, HeaderName, HeaderValue, Response, StatusCode};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::TunnelError;
use crate::flow::WindowSlot;
use crate::protocol::frames::is_hop_by_hop;
use crate::protocol::{RequestHead, TunnelFrame, WsFrame};
use crate::router::registry::RouterRegistry;
use crate::router::socket::{ExchangeEvent, TunnelSocket};

/// Dispatches client exchanges onto registered tunnel sockets.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RouterRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RouterRegistry>) -> Self {
        Self { registry }
    }

    /// Pick a socket for the route and occupy a window slot on it.
    ///
    /// Candidates are ordered by fewest in-flight exchanges, ties broken
    /// least-recently-used. Acquisition re-checks the ceiling atomically,
    /// so a concurrent assignment can never overshoot a window.
    fn select_socket(&self, route: &str) -> Result<(Arc<TunnelSocket>, WindowSlot), TunnelError> {
        let snapshot = self.registry.snapshot(route);
        if snapshot.is_empty() {
            return Err(TunnelError::NoConnectorsAvailable(route.to_string()));
        }

        let mut candidates: Vec<&Arc<TunnelSocket>> =
            snapshot.iter().filter(|s| s.is_selectable()).collect();
        candidates.sort_by_key(|s| (s.in_flight(), s.last_used_ms()));

        for socket in candidates {
            if let Some(slot) = socket.window().try_acquire() {
                return Ok((socket.clone(), slot));
            }
        }
        // Sockets exist but every window is full; surfaced the same way as
        // an empty pool so the caller maps it to service-unavailable.
        Err(TunnelError::NoConnectorsAvailable(route.to_string()))
    }

    /// Relay one HTTP exchange. Returns the response with a streaming
    /// body; the exchange's window slot is released when that body
    /// completes or the client disconnects.
    pub async fn handle(
        &self,
        route: &str,
        parts: request::Parts,
        body: Body,
    ) -> Result<Response<Body>, TunnelError> {
        let (socket, slot) = self.select_socket(route)?;
        let mut exchange = socket.open_exchange()?;
        let mut guard = ExchangeGuard::new(socket.clone(), exchange.id, slot);

        let head = request_head_from_parts(&parts, false);
        socket
            .send_frame(&TunnelFrame::ReqHead {
                id: exchange.id,
                head,
            })
            .await?;

        pump_request_body(socket.clone(), exchange.id, exchange.send_credit.clone(), body);

        // First event must be the response head.
        let response_head = loop {
            match exchange.events.recv().await {
                Some(ExchangeEvent::Head(head)) => break head,
                Some(ExchangeEvent::Ws(_)) => continue,
                Some(ExchangeEvent::Body(_)) | Some(ExchangeEvent::End) => {
                    return Err(TunnelError::Protocol(
                        "response body frame before response head".into(),
                    ));
                }
                Some(ExchangeEvent::Broken) | None => return Err(TunnelError::TunnelBroken),
            }
        };

        guard.response_started = true;
        let mut builder = Response::builder().status(
            StatusCode::from_u16(response_head.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        );
        for (name, value) in &response_head.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                builder = builder.header(name, value);
            }
        }

        let stream = ExchangeBodyStream {
            events: exchange.events,
            guard: Some(guard),
            finished: false,
        };
        builder
            .body(Body::from_stream(stream))
            .map_err(|e| TunnelError::Protocol(format!("invalid response head: {e}")))
    }

    /// Relay a WebSocket pass-through exchange after the client upgrade
    /// completes. Close frames propagate in both directions.
    pub async fn handle_websocket(&self, route: &str, parts: request::Parts, client: WebSocket) {
        let (socket, slot) = match self.select_socket(route) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(route = %route, error = %e, "WebSocket exchange has no socket");
                return;
            }
        };
        let mut exchange = match socket.open_exchange() {
            Ok(exchange) => exchange,
            Err(e) => {
                tracing::warn!(route = %route, error = %e, "WebSocket exchange failed to open");
                return;
            }
        };
        let mut guard = ExchangeGuard::new(socket.clone(), exchange.id, slot);

        let head = request_head_from_parts(&parts, true);
        if socket
            .send_frame(&TunnelFrame::ReqHead {
                id: exchange.id,
                head,
            })
            .await
            .is_err()
        {
            return;
        }

        // The connector answers with a 101 head once its own upgrade to
        // the target succeeds.
        match exchange.events.recv().await {
            Some(ExchangeEvent::Head(head)) if head.status == 101 => {}
            Some(ExchangeEvent::Head(head)) => {
                tracing::warn!(route = %route, status = head.status, "Target declined WebSocket upgrade");
                return;
            }
            _ => return,
        }
        guard.response_started = true;

        let (mut client_tx, mut client_rx) = client.split();
        loop {
            tokio::select! {
                client_msg = client_rx.next() => {
                    let frame = match client_msg {
                        Some(Ok(msg)) => ws_frame_from_message(msg),
                        Some(Err(_)) | None => Some(WsFrame::Close),
                    };
                    let Some(frame) = frame else { continue };
                    let is_close = frame == WsFrame::Close;
                    if socket
                        .send_frame(&TunnelFrame::WsFrame { id: exchange.id, frame })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    if is_close {
                        guard.complete();
                        break;
                    }
                }
                event = exchange.events.recv() => {
                    match event {
                        Some(ExchangeEvent::Ws(WsFrame::Close)) => {
                            let _ = client_tx.send(Message::Close(None)).await;
                            guard.complete();
                            break;
                        }
                        Some(ExchangeEvent::Ws(frame)) => {
                            if client_tx.send(message_from_ws_frame(frame)).await.is_err() {
                                break;
                            }
                        }
                        Some(ExchangeEvent::Broken) | None => {
                            let _ = client_tx.send(Message::Close(None)).await;
                            break;
                        }
                        Some(_) => continue,
                    }
                }
            }
        }
    }
}

/// Build the tunneled request head, stripping hop-by-hop headers.
fn request_head_from_parts(parts: &request::Parts, ws: bool) -> RequestHead {
    let headers = parts
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let has_body = parts.headers.contains_key("content-length")
        || parts.headers.contains_key("transfer-encoding");
    RequestHead {
        method: parts.method.as_str().to_string(),
        target: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string()),
        headers,
        body: has_body && !ws,
        ws,
    }
}

/// Stream the client's request body into the tunnel as it arrives.
fn pump_request_body(
    socket: Arc<TunnelSocket>,
    id: u32,
    credit: Arc<crate::flow::Credit>,
    body: Body,
) {
    tokio::spawn(async move {
        let multiplexed = socket.version().is_multiplexed();
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) if chunk.is_empty() => continue,
                Ok(chunk) => {
                    if multiplexed {
                        credit.consume(chunk.len()).await;
                    }
                    if socket
                        .send_frame(&TunnelFrame::ReqBody {
                            id,
                            chunk: chunk.to_vec(),
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    // Client went away mid-body; tell the connector.
                    tracing::debug!(exchange_id = id, error = %e, "Request body aborted");
                    socket.try_send_frame(&TunnelFrame::Cancel { id });
                    return;
                }
            }
        }
        let _ = socket.send_frame(&TunnelFrame::ReqEnd { id }).await;
    });
}

/// Releases exchange state when the relay ends, however it ends.
///
/// If the exchange did not complete cleanly, a cancel frame is sent
/// best-effort so the connector can abandon its side.
struct ExchangeGuard {
    socket: Arc<TunnelSocket>,
    id: u32,
    // Held for its Drop: releases the window slot with the guard.
    _slot: WindowSlot,
    response_started: bool,
    completed: bool,
}

impl ExchangeGuard {
    fn new(socket: Arc<TunnelSocket>, id: u32, slot: WindowSlot) -> Self {
        Self {
            socket,
            id,
            _slot: slot,
            response_started: false,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.socket.try_send_frame(&TunnelFrame::Cancel { id: self.id });
        }
        self.socket.finish_exchange(self.id);
    }
}

/// Response body as a stream of chunks from the exchange's event queue.
struct ExchangeBodyStream {
    events: mpsc::Receiver<ExchangeEvent>,
    guard: Option<ExchangeGuard>,
    finished: bool,
}

impl Stream for ExchangeBodyStream {
    type Item = Result<Bytes, TunnelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        loop {
            match self.events.poll_recv(cx) {
                Poll::Ready(Some(ExchangeEvent::Body(chunk))) => {
                    return Poll::Ready(Some(Ok(Bytes::from(chunk))));
                }
                Poll::Ready(Some(ExchangeEvent::End)) => {
                    self.finished = true;
                    if let Some(guard) = self.guard.as_mut() {
                        guard.complete();
                    }
                    self.guard.take();
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(ExchangeEvent::Broken)) | Poll::Ready(None) => {
                    self.finished = true;
                    self.guard.take();
                    return Poll::Ready(Some(Err(TunnelError::TunnelBroken)));
                }
                // Heads and ws frames are not part of an HTTP body.
                Poll::Ready(Some(_)) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn ws_frame_from_message(msg: Message) -> Option<WsFrame> {
    match msg {
        Message::Text(text) => Some(WsFrame::Text(text.to_string())),
        Message::Binary(data) => Some(WsFrame::Binary(data.to_vec())),
        Message::Ping(data) => Some(WsFrame::Ping(data.to_vec())),
        Message::Pong(data) => Some(WsFrame::Pong(data.to_vec())),
        Message::Close(_) => Some(WsFrame::Close),
    }
}

fn message_from_ws_frame(frame: WsFrame) -> Message {
    match frame {
        WsFrame::Text(text) => Message::Text(text.into()),
        WsFrame::Binary(data) => Message::Binary(data.into()),
        WsFrame::Ping(data) => Message::Ping(data.into()),
        WsFrame::Pong(data) => Message::Pong(data.into()),
        WsFrame::Close => Message::Close(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeCause;
    use crate::protocol::{codec_for, CodecSide, ProtocolVersion};
    use std::time::Duration;

    fn test_registry() -> Arc<RouterRegistry> {
        Arc::new(RouterRegistry::new(Duration::from_secs(300)))
    }

    fn register_socket(
        registry: &Arc<RouterRegistry>,
        component: &str,
        window: usize,
    ) -> Arc<TunnelSocket> {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let socket = Arc::new(TunnelSocket::new(
            "example".into(),
            component.into(),
            ProtocolVersion::V2,
            codec_for(ProtocolVersion::V2, CodecSide::Router),
            window,
            tx,
        ));
        registry
            .register(socket.clone(), "127.0.0.1".parse().unwrap())
            .unwrap();
        socket
    }

    #[test]
    fn empty_route_fails_immediately() {
        let dispatcher = Dispatcher::new(test_registry());
        let err = dispatcher.select_socket("example").unwrap_err();
        assert!(matches!(err, TunnelError::NoConnectorsAvailable(route) if route == "example"));
    }

    #[test]
    fn selection_prefers_fewest_in_flight() {
        let registry = test_registry();
        let busy = register_socket(&registry, "a", 4);
        let quiet = register_socket(&registry, "b", 4);

        let _held = busy.window().try_acquire().unwrap();

        let dispatcher = Dispatcher::new(registry);
        let (selected, _slot) = dispatcher.select_socket("example").unwrap();
        assert_eq!(selected.id, quiet.id);
    }

    #[test]
    fn sockets_at_their_ceiling_are_skipped() {
        let registry = test_registry();
        let socket = register_socket(&registry, "a", 1);
        let _held = socket.window().try_acquire().unwrap();

        let dispatcher = Dispatcher::new(registry);
        let err = dispatcher.select_socket("example").unwrap_err();
        assert!(matches!(err, TunnelError::NoConnectorsAvailable(_)));
    }

    #[test]
    fn deregistered_sockets_are_not_selected() {
        let registry = test_registry();
        let socket = register_socket(&registry, "a", 4);
        registry.deregister(&socket, ChangeCause::Deregistered);

        let dispatcher = Dispatcher::new(registry);
        assert!(dispatcher.select_socket("example").is_err());
    }
}
