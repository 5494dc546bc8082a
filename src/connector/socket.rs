//! Connector-side tunnel socket plumbing.
//!
//! Mirrors the router's socket bookkeeping from the other end: decoded
//! frames are routed to per-exchange forwarder tasks, and outgoing frames
//! are queued to the write task.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use crate::error::TunnelError;
use crate::flow::{Credit, INITIAL_STREAM_CREDIT};
use crate::protocol::frames::{WireMessage, WriteCmd};
use crate::protocol::{ProtocolVersion, TunnelCodec, TunnelFrame, WsFrame};

/// Depth of each exchange's inbound queue; bounds request bytes buffered
/// on the connector before credit is granted back to the router.
const EXCHANGE_QUEUE_DEPTH: usize = 16;

/// Messages delivered to one forwarder exchange task.
#[derive(Debug)]
pub enum InboundMsg {
    Body(Vec<u8>),
    End,
    Ws(WsFrame),
    Cancel,
}

struct ExchangeEntry {
    tx: mpsc::Sender<InboundMsg>,
    /// Credit for response body bytes flowing connector → router.
    send_credit: Arc<Credit>,
    cancel: watch::Sender<bool>,
}

/// Everything a forwarder task needs for one exchange.
pub struct ExchangeRx {
    pub inbound: mpsc::Receiver<InboundMsg>,
    pub send_credit: Arc<Credit>,
    pub cancelled: watch::Receiver<bool>,
}

/// One established tunnel socket, as seen by the connector.
pub struct ConnectorSocket {
    /// Router registration URI this socket is connected to.
    pub router: String,
    version: ProtocolVersion,
    codec: Box<dyn TunnelCodec>,
    writer: mpsc::Sender<WriteCmd>,
    exchanges: DashMap<u32, ExchangeEntry>,
}

impl ConnectorSocket {
    pub fn new(
        router: String,
        version: ProtocolVersion,
        codec: Box<dyn TunnelCodec>,
        writer: mpsc::Sender<WriteCmd>,
    ) -> Self {
        Self {
            router,
            version,
            codec,
            writer,
            exchanges: DashMap::new(),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Wire up correlation state for a newly assigned exchange.
    pub fn register_exchange(&self, id: u32) -> ExchangeRx {
        let (tx, rx) = mpsc::channel(EXCHANGE_QUEUE_DEPTH);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let send_credit = Arc::new(Credit::new(INITIAL_STREAM_CREDIT));
        self.exchanges.insert(
            id,
            ExchangeEntry {
                tx,
                send_credit: send_credit.clone(),
                cancel: cancel_tx,
            },
        );
        ExchangeRx {
            inbound: rx,
            send_credit,
            cancelled: cancel_rx,
        }
    }

    pub fn remove_exchange(&self, id: u32) {
        self.exchanges.remove(&id);
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }

    pub async fn send_frame(&self, frame: &TunnelFrame) -> Result<(), TunnelError> {
        let wire = self.codec.encode(frame)?;
        self.writer
            .send(WriteCmd::Frame(wire))
            .await
            .map_err(|_| TunnelError::TunnelBroken)
    }

    pub fn try_send_frame(&self, frame: &TunnelFrame) {
        if let Ok(wire) = self.codec.encode(frame) {
            let _ = self.writer.try_send(WriteCmd::Frame(wire));
        }
    }

    /// Ask the write task to close the transport.
    pub fn shutdown_transport(&self) {
        let _ = self.writer.try_send(WriteCmd::Shutdown);
    }

    pub fn decode(&self, msg: WireMessage) -> Result<TunnelFrame, TunnelError> {
        self.codec.decode(msg)
    }

    /// Route one decoded frame to its exchange task. Request heads are
    /// handled by the caller (they spawn new exchanges).
    pub async fn route_frame(&self, frame: TunnelFrame) {
        let id = frame.exchange_id();
        let entry = match self.exchanges.get(&id) {
            Some(e) => (e.tx.clone(), e.send_credit.clone()),
            None => {
                tracing::debug!(exchange_id = id, "Frame for unknown exchange");
                return;
            }
        };
        let (tx, send_credit) = entry;

        match frame {
            TunnelFrame::ReqBody { chunk, .. } => {
                let granted = chunk.len();
                if tx.send(InboundMsg::Body(chunk)).await.is_ok()
                    && self.version.is_multiplexed()
                {
                    let _ = self
                        .send_frame(&TunnelFrame::WindowUpdate {
                            id,
                            credit: granted as u32,
                        })
                        .await;
                }
            }
            TunnelFrame::ReqEnd { .. } => {
                let _ = tx.send(InboundMsg::End).await;
            }
            TunnelFrame::WsFrame { frame, .. } => {
                let _ = tx.send(InboundMsg::Ws(frame)).await;
            }
            TunnelFrame::Cancel { .. } => {
                if let Some(entry) = self.exchanges.get(&id) {
                    let _ = entry.cancel.send(true);
                }
                let _ = tx.try_send(InboundMsg::Cancel);
            }
            TunnelFrame::WindowUpdate { credit, .. } => {
                send_credit.replenish(credit as usize);
            }
            TunnelFrame::ReqHead { .. } => unreachable!("request heads are handled by the read loop"),
            TunnelFrame::RspHead { .. }
            | TunnelFrame::RspBody { .. }
            | TunnelFrame::RspEnd { .. } => {
                tracing::warn!(exchange_id = id, "Router sent a response frame; ignoring");
            }
        }
    }

    /// Fail every in-flight exchange; the transport is gone.
    pub fn fail_all_exchanges(&self) {
        let ids: Vec<u32> = self.exchanges.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.exchanges.remove(&id) {
                let _ = entry.cancel.send(true);
                let _ = entry.tx.try_send(InboundMsg::Cancel);
            }
        }
    }
}
