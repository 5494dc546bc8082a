//! Forwards tunneled exchanges to the local target service.
//!
//! # Responsibilities
//! - Rebuild each tunneled request as a real HTTP request to the target
//! - Stream request and response bodies without buffering whole payloads
//! - Pump WebSocket exchanges to the target over a second client socket
//! - Synthesize a 502 response when the target cannot be reached
//!
//! # Design Decisions
//! - One hyper client is shared across all exchanges; connection pooling
//!   to the target lives there, not in the tunnel layer.
//! - A target failure is reported back through the tunnel as a response,
//!   never by dropping the exchange: the router must be able to tell
//!   "target down" (502 from here) apart from "tunnel broken".

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, Uri};
use futures_util::{SinkExt, Stream, StreamExt};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TtMessage;

use crate::error::TunnelError;
use crate::events::ConnectorEvent;
use crate::protocol::frames::is_hop_by_hop;
use crate::protocol::{RequestHead, ResponseHead, TunnelFrame, WsFrame, COMPONENT_HEADER};

use super::socket::{ConnectorSocket, ExchangeRx, InboundMsg};

/// Shared forwarding state for one connector.
pub struct Forwarder {
    target: String,
    component: String,
    client: Client<HttpConnector, Body>,
    events: broadcast::Sender<ConnectorEvent>,
    /// Exchanges currently being forwarded, across all sockets.
    in_flight: Arc<AtomicUsize>,
    /// Cleared by `Connector::stop`; new exchanges get an immediate 503.
    accepting: Arc<AtomicBool>,
}

impl Forwarder {
    pub fn new(
        target: String,
        component: String,
        events: broadcast::Sender<ConnectorEvent>,
        in_flight: Arc<AtomicUsize>,
        accepting: Arc<AtomicBool>,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            target: target.trim_end_matches('/').to_string(),
            component,
            client,
            events,
            in_flight,
            accepting,
        }
    }

    /// Spawn the forwarding task for a newly received request head.
    pub fn spawn_exchange(
        self: &Arc<Self>,
        socket: Arc<ConnectorSocket>,
        id: u32,
        head: RequestHead,
    ) {
        let forwarder = self.clone();
        let rx = socket.register_exchange(id);
        forwarder.in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            if forwarder.accepting.load(Ordering::SeqCst) {
                if head.ws {
                    forwarder.run_websocket(&socket, id, head, rx).await;
                } else {
                    forwarder.run_http(&socket, id, head, rx).await;
                }
            } else {
                forwarder.respond_error(&socket, id, 503).await;
            }

            socket.remove_exchange(id);
            forwarder.in_flight.fetch_sub(1, Ordering::SeqCst);

            // Single-exchange sockets are spent once their exchange ends.
            if !socket.version().is_multiplexed() {
                socket.shutdown_transport();
            }
        });
    }

    /// Forward one HTTP exchange to the target and stream the response back.
    async fn run_http(&self, socket: &Arc<ConnectorSocket>, id: u32, head: RequestHead, rx: ExchangeRx) {
        let ExchangeRx {
            inbound,
            send_credit,
            mut cancelled,
        } = rx;

        let request = match self.build_request(&head, inbound) {
            Ok(request) => request,
            Err(e) => {
                self.emit_proxy_error(&head, &e);
                self.respond_error(socket, id, 502).await;
                return;
            }
        };

        let response = match self.client.request(request).await {
            Ok(response) => response,
            Err(e) => {
                let error = TunnelError::TargetUnreachable(e.to_string());
                self.emit_proxy_error(&head, &error);
                self.respond_error(socket, id, 502).await;
                return;
            }
        };

        let status = response.status().as_u16();
        let headers = response_headers(response.headers());
        let (_, incoming) = response.into_parts();

        if socket
            .send_frame(&TunnelFrame::RspHead {
                id,
                head: ResponseHead { status, headers },
            })
            .await
            .is_err()
        {
            return;
        }

        let mut body = Body::new(incoming).into_data_stream();
        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = cancelled.changed() => {
                    tracing::debug!(exchange_id = id, "Exchange cancelled mid-response");
                    return;
                }
            };
            match chunk {
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    if socket.version().is_multiplexed() {
                        send_credit.consume(bytes.len()).await;
                    }
                    let frame = TunnelFrame::RspBody {
                        id,
                        chunk: bytes.to_vec(),
                    };
                    if socket.send_frame(&frame).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    let error = TunnelError::TargetUnreachable(e.to_string());
                    self.emit_proxy_error(&head, &error);
                    socket.try_send_frame(&TunnelFrame::Cancel { id });
                    return;
                }
                None => break,
            }
        }

        let _ = socket.send_frame(&TunnelFrame::RspEnd { id }).await;
    }

    /// Forward one WebSocket exchange: open a client socket to the target
    /// and pump frames both ways until either side closes.
    async fn run_websocket(
        &self,
        socket: &Arc<ConnectorSocket>,
        id: u32,
        head: RequestHead,
        rx: ExchangeRx,
    ) {
        let ExchangeRx { mut inbound, .. } = rx;

        let url = ws_target_url(&self.target, &head.target);
        let (target, _response) = match connect_async(url.as_str()).await {
            Ok(pair) => pair,
            Err(e) => {
                let error = TunnelError::TargetUnreachable(e.to_string());
                self.emit_proxy_error(&head, &error);
                self.respond_error(socket, id, 502).await;
                return;
            }
        };

        if socket
            .send_frame(&TunnelFrame::RspHead {
                id,
                head: ResponseHead {
                    status: 101,
                    headers: Vec::new(),
                },
            })
            .await
            .is_err()
        {
            return;
        }

        let (mut target_tx, mut target_rx) = target.split();
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(InboundMsg::Ws(frame)) => {
                        let close = matches!(frame, WsFrame::Close);
                        if target_tx.send(tt_message_from_ws_frame(frame)).await.is_err() || close {
                            break;
                        }
                    }
                    Some(InboundMsg::Cancel) | None => {
                        let _ = target_tx.send(TtMessage::Close(None)).await;
                        break;
                    }
                    Some(InboundMsg::Body(_)) | Some(InboundMsg::End) => {}
                },
                msg = target_rx.next() => match msg {
                    Some(Ok(msg)) => {
                        let Some(frame) = ws_frame_from_tt_message(msg) else { continue };
                        let close = matches!(frame, WsFrame::Close);
                        if socket.send_frame(&TunnelFrame::WsFrame { id, frame }).await.is_err() {
                            break;
                        }
                        if close {
                            break;
                        }
                    }
                    Some(Err(_)) | None => {
                        socket.try_send_frame(&TunnelFrame::WsFrame { id, frame: WsFrame::Close });
                        break;
                    }
                },
            }
        }
    }

    fn build_request(
        &self,
        head: &RequestHead,
        inbound: tokio::sync::mpsc::Receiver<InboundMsg>,
    ) -> Result<Request<Body>, TunnelError> {
        let uri: Uri = format!("{}{}", self.target, head.target)
            .parse()
            .map_err(|e| TunnelError::Protocol(format!("bad target uri: {e}")))?;
        let method = Method::from_bytes(head.method.as_bytes())
            .map_err(|e| TunnelError::Protocol(format!("bad method: {e}")))?;

        let body = if head.body {
            Body::from_stream(InboundBodyStream {
                inbound,
                finished: false,
            })
        } else {
            Body::empty()
        };

        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in &head.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = builder.header(COMPONENT_HEADER, self.component.as_str());
        builder
            .body(body)
            .map_err(|e| TunnelError::Protocol(format!("bad request head: {e}")))
    }

    /// Report a failed exchange back through the tunnel as a plain response.
    async fn respond_error(&self, socket: &Arc<ConnectorSocket>, id: u32, status: u16) {
        let head = ResponseHead {
            status,
            headers: vec![("content-length".to_string(), "0".to_string())],
        };
        if socket
            .send_frame(&TunnelFrame::RspHead { id, head })
            .await
            .is_ok()
        {
            let _ = socket.send_frame(&TunnelFrame::RspEnd { id }).await;
        }
    }

    fn emit_proxy_error(&self, head: &RequestHead, error: &TunnelError) {
        tracing::warn!(
            method = %head.method,
            target = %head.target,
            error = %error,
            "Forwarding to target failed"
        );
        let _ = self.events.send(ConnectorEvent::ProxyError {
            method: head.method.clone(),
            target: head.target.clone(),
            error: error.to_string(),
        });
    }
}

/// Request body fed to hyper from tunneled body frames.
struct InboundBodyStream {
    inbound: tokio::sync::mpsc::Receiver<InboundMsg>,
    finished: bool,
}

impl Stream for InboundBodyStream {
    type Item = Result<Bytes, TunnelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        loop {
            match self.inbound.poll_recv(cx) {
                Poll::Ready(Some(InboundMsg::Body(chunk))) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(Bytes::from(chunk))));
                }
                Poll::Ready(Some(InboundMsg::End)) => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(InboundMsg::Cancel)) | Poll::Ready(None) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(TunnelError::TunnelBroken)));
                }
                Poll::Ready(Some(InboundMsg::Ws(_))) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn response_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn ws_target_url(target: &str, path: &str) -> String {
    let base = if let Some(rest) = target.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = target.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        target.to_string()
    };
    format!("{base}{path}")
}

fn tt_message_from_ws_frame(frame: WsFrame) -> TtMessage {
    match frame {
        WsFrame::Text(text) => TtMessage::Text(text.into()),
        WsFrame::Binary(data) => TtMessage::Binary(data.into()),
        WsFrame::Ping(data) => TtMessage::Ping(data.into()),
        WsFrame::Pong(data) => TtMessage::Pong(data.into()),
        WsFrame::Close => TtMessage::Close(None),
    }
}

fn ws_frame_from_tt_message(msg: TtMessage) -> Option<WsFrame> {
    match msg {
        TtMessage::Text(text) => Some(WsFrame::Text(text.to_string())),
        TtMessage::Binary(data) => Some(WsFrame::Binary(data.to_vec())),
        TtMessage::Ping(data) => Some(WsFrame::Ping(data.to_vec())),
        TtMessage::Pong(data) => Some(WsFrame::Pong(data.to_vec())),
        TtMessage::Close(_) => Some(WsFrame::Close),
        TtMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    #[test]
    fn ws_url_swaps_scheme() {
        assert_eq!(
            ws_target_url("http://localhost:14444", "/example/echo"),
            "ws://localhost:14444/example/echo"
        );
        assert_eq!(
            ws_target_url("https://svc.internal", "/x"),
            "wss://svc.internal/x"
        );
    }

    #[test]
    fn response_headers_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        let out = response_headers(&headers);
        assert_eq!(out, vec![("content-type".to_string(), "text/plain".to_string())]);
    }

    #[test]
    fn header_name_roundtrip_is_lowercase() {
        let name: HeaderName = "X-Custom".parse().unwrap();
        assert_eq!(name.as_str(), "x-custom");
    }
}
