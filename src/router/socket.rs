//! Router-side tunnel socket.
//!
//! # Responsibilities
//! - Own the per-socket state machine and activity bookkeeping
//! - Correlate incoming frames to their exchange relay tasks
//! - Enforce the in-flight window and per-exchange send credit
//!
//! # Concurrency
//! A socket is driven by one read-loop task and one write task fed over an
//! mpsc channel; reads and writes run concurrently (the transport is
//! full-duplex). Exchange bookkeeping uses atomics and a `DashMap` so no
//! lock is held across an await.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TunnelError;
use crate::events::ChangeCause;
use crate::flow::{Credit, Window, INITIAL_STREAM_CREDIT};
use crate::protocol::frames::WriteCmd;
use crate::protocol::{ProtocolVersion, ResponseHead, TunnelCodec, TunnelFrame, WsFrame};

/// Depth of each exchange's event queue. Bounds response bytes buffered on
/// the router before credit is granted back to the connector.
const EXCHANGE_QUEUE_DEPTH: usize = 16;

/// Socket lifecycle states. `Registered` and `Idle` are equivalent for
/// selection purposes; `Closed` is terminal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting = 0,
    Registered = 1,
    Active = 2,
    Idle = 3,
    Closing = 4,
    Closed = 5,
}

impl From<u8> for SocketState {
    fn from(val: u8) -> Self {
        match val {
            1 => SocketState::Registered,
            2 => SocketState::Active,
            3 => SocketState::Idle,
            4 => SocketState::Closing,
            5 => SocketState::Closed,
            _ => SocketState::Connecting,
        }
    }
}

/// Frame-level events delivered to one exchange's relay task.
///
/// A relay task also treats its channel closing as `Broken`: when the
/// socket dies the correlation entry is dropped, so the receiver ends
/// even if the buffered `Broken` could not be enqueued.
#[derive(Debug)]
pub enum ExchangeEvent {
    Head(ResponseHead),
    Body(Vec<u8>),
    End,
    Ws(WsFrame),
    Broken,
}

struct ExchangeHandle {
    tx: mpsc::Sender<ExchangeEvent>,
    /// Credit for request body bytes flowing router → connector.
    send_credit: Arc<Credit>,
}

/// Everything a dispatcher relay task needs for one opened exchange.
pub struct OpenExchange {
    pub id: u32,
    pub events: mpsc::Receiver<ExchangeEvent>,
    pub send_credit: Arc<Credit>,
}

/// One registered tunnel to a connector, as seen by the router.
pub struct TunnelSocket {
    pub id: Uuid,
    pub route: String,
    pub component: String,
    version: ProtocolVersion,
    codec: Box<dyn TunnelCodec>,
    state: AtomicU8,
    window: Arc<Window>,
    created_at: Instant,
    last_activity_ms: AtomicU64,
    last_used_ms: AtomicU64,
    close_cause: AtomicU8,
    writer: mpsc::Sender<WriteCmd>,
    exchanges: DashMap<u32, ExchangeHandle>,
    next_exchange_id: AtomicU32,
}

/// Milliseconds since process start, shared so last-used stamps compare
/// across sockets.
fn clock_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

impl TunnelSocket {
    pub fn new(
        route: String,
        component: String,
        version: ProtocolVersion,
        codec: Box<dyn TunnelCodec>,
        window_size: usize,
        writer: mpsc::Sender<WriteCmd>,
    ) -> Self {
        // The single-exchange protocol occupies a whole socket per
        // exchange, so its window is pinned to 1.
        let effective_window = if version.is_multiplexed() {
            window_size
        } else {
            1
        };
        let now = clock_ms();
        Self {
            id: Uuid::new_v4(),
            route,
            component,
            version,
            codec,
            state: AtomicU8::new(SocketState::Connecting as u8),
            window: Arc::new(Window::new(effective_window)),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(now),
            last_used_ms: AtomicU64::new(now),
            close_cause: AtomicU8::new(cause_to_u8(ChangeCause::SocketClosed)),
            writer,
            exchanges: DashMap::new(),
            next_exchange_id: AtomicU32::new(1),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn state(&self) -> SocketState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    pub fn in_flight(&self) -> usize {
        self.window.in_flight()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Registered, Active, and Idle sockets with window capacity can take
    /// new exchanges.
    pub fn is_selectable(&self) -> bool {
        matches!(
            self.state(),
            SocketState::Registered | SocketState::Active | SocketState::Idle
        ) && self.window.has_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SocketState::Closed
    }

    /// Stamp transport activity, deferring the idle sweep.
    pub fn touch(&self) {
        self.last_activity_ms.store(clock_ms(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(clock_ms().saturating_sub(last))
    }

    /// Last-used stamp for least-recently-used tie-breaking.
    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    fn transition(&self, allowed_from: &[SocketState], to: SocketState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !allowed_from.contains(&current.into()) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Registration handshake accepted.
    pub fn mark_registered(&self) -> bool {
        self.transition(&[SocketState::Connecting], SocketState::Registered)
    }

    /// Open a new exchange on this socket. The caller must already hold a
    /// window slot; this only wires up correlation state.
    pub fn open_exchange(&self) -> Result<OpenExchange, TunnelError> {
        if !matches!(
            self.state(),
            SocketState::Registered | SocketState::Active | SocketState::Idle
        ) {
            return Err(TunnelError::TunnelBroken);
        }

        let id = if self.version.is_multiplexed() {
            self.next_exchange_id.fetch_add(1, Ordering::Relaxed)
        } else {
            0
        };
        let (tx, rx) = mpsc::channel(EXCHANGE_QUEUE_DEPTH);
        let send_credit = Arc::new(Credit::new(INITIAL_STREAM_CREDIT));
        self.exchanges.insert(
            id,
            ExchangeHandle {
                tx,
                send_credit: send_credit.clone(),
            },
        );

        self.last_used_ms.store(clock_ms(), Ordering::Relaxed);
        self.transition(
            &[SocketState::Registered, SocketState::Idle],
            SocketState::Active,
        );

        Ok(OpenExchange {
            id,
            events: rx,
            send_credit,
        })
    }

    /// Tear down one exchange's correlation state. Single-exchange sockets
    /// are consumed by their exchange and begin closing here.
    pub fn finish_exchange(&self, id: u32) {
        self.exchanges.remove(&id);
        if !self.version.is_multiplexed() {
            self.begin_close(ChangeCause::SocketClosed);
            return;
        }
        if self.exchanges.is_empty() {
            self.transition(&[SocketState::Active], SocketState::Idle);
        }
    }

    /// Encode and queue a frame for the write task.
    pub async fn send_frame(&self, frame: &TunnelFrame) -> Result<(), TunnelError> {
        let wire = self.codec.encode(frame)?;
        self.writer
            .send(WriteCmd::Frame(wire))
            .await
            .map_err(|_| TunnelError::TunnelBroken)
    }

    /// Best-effort frame send from non-async contexts (Drop paths).
    pub fn try_send_frame(&self, frame: &TunnelFrame) {
        if let Ok(wire) = self.codec.encode(frame) {
            let _ = self.writer.try_send(WriteCmd::Frame(wire));
        }
    }

    /// Decode one wire message from the read loop and route it.
    pub async fn dispatch_wire(&self, msg: crate::protocol::WireMessage) {
        self.touch();
        let frame = match self.codec.decode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(socket_id = %self.id, route = %self.route, error = %e, "Dropping undecodable frame");
                return;
            }
        };
        self.dispatch_frame(frame).await;
    }

    async fn dispatch_frame(&self, frame: TunnelFrame) {
        let id = frame.exchange_id();
        let handle = match self.exchanges.get(&id) {
            Some(h) => {
                // Clone out so no map ref is held across an await.
                (h.tx.clone(), h.send_credit.clone())
            }
            None => {
                tracing::debug!(socket_id = %self.id, exchange_id = id, "Frame for unknown exchange");
                return;
            }
        };
        let (tx, send_credit) = handle;

        match frame {
            TunnelFrame::RspHead { head, .. } => {
                let _ = tx.send(ExchangeEvent::Head(head)).await;
            }
            TunnelFrame::RspBody { chunk, .. } => {
                let granted = chunk.len();
                if tx.send(ExchangeEvent::Body(chunk)).await.is_ok()
                    && self.version.is_multiplexed()
                {
                    // Credit is granted once the chunk is queued; the
                    // bounded queue provides the actual backpressure.
                    let _ = self
                        .send_frame(&TunnelFrame::WindowUpdate {
                            id,
                            credit: granted as u32,
                        })
                        .await;
                }
            }
            TunnelFrame::RspEnd { .. } => {
                let _ = tx.send(ExchangeEvent::End).await;
            }
            TunnelFrame::WsFrame { frame, .. } => {
                let _ = tx.send(ExchangeEvent::Ws(frame)).await;
            }
            TunnelFrame::Cancel { .. } => {
                let _ = tx.send(ExchangeEvent::Broken).await;
            }
            TunnelFrame::WindowUpdate { credit, .. } => {
                send_credit.replenish(credit as usize);
            }
            TunnelFrame::ReqHead { .. } | TunnelFrame::ReqBody { .. } | TunnelFrame::ReqEnd { .. } => {
                tracing::warn!(socket_id = %self.id, "Connector sent a request frame; ignoring");
            }
        }
    }

    /// Start closing: any state except Closed may enter Closing. The write
    /// task closes the transport once queued frames are flushed.
    pub fn begin_close(&self, cause: ChangeCause) {
        if self.transition(
            &[
                SocketState::Connecting,
                SocketState::Registered,
                SocketState::Active,
                SocketState::Idle,
            ],
            SocketState::Closing,
        ) {
            self.close_cause.store(cause_to_u8(cause), Ordering::Release);
            let _ = self.writer.try_send(WriteCmd::Shutdown);
        }
    }

    /// Terminal transition, run when the transport is gone. Fails every
    /// in-flight exchange with `TunnelBroken`.
    pub fn mark_closed(&self) {
        self.begin_close(ChangeCause::SocketClosed);
        self.state.store(SocketState::Closed as u8, Ordering::Release);

        let ids: Vec<u32> = self.exchanges.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.exchanges.remove(&id) {
                let _ = handle.tx.try_send(ExchangeEvent::Broken);
            }
        }
    }

    pub fn close_cause(&self) -> ChangeCause {
        cause_from_u8(self.close_cause.load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for TunnelSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSocket")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("component", &self.component)
            .field("version", &self.version)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn cause_to_u8(cause: ChangeCause) -> u8 {
    match cause {
        ChangeCause::Registered => 0,
        ChangeCause::Deregistered => 1,
        ChangeCause::IdleTimeout => 2,
        ChangeCause::SocketClosed => 3,
    }
}

fn cause_from_u8(v: u8) -> ChangeCause {
    match v {
        0 => ChangeCause::Registered,
        1 => ChangeCause::Deregistered,
        2 => ChangeCause::IdleTimeout,
        _ => ChangeCause::SocketClosed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{codec_for, CodecSide};

    fn test_socket(version: ProtocolVersion) -> TunnelSocket {
        let (tx, _rx) = mpsc::channel(8);
        TunnelSocket::new(
            "example".into(),
            "example-1".into(),
            version,
            codec_for(version, CodecSide::Router),
            4,
            tx,
        )
    }

    #[test]
    fn follows_lifecycle_transitions() {
        let socket = test_socket(ProtocolVersion::V2);
        assert_eq!(socket.state(), SocketState::Connecting);
        assert!(socket.mark_registered());
        assert_eq!(socket.state(), SocketState::Registered);

        let exchange = socket.open_exchange().unwrap();
        assert_eq!(socket.state(), SocketState::Active);

        socket.finish_exchange(exchange.id);
        assert_eq!(socket.state(), SocketState::Idle);
    }

    #[test]
    fn closed_is_terminal() {
        let socket = test_socket(ProtocolVersion::V2);
        socket.mark_registered();
        socket.mark_closed();
        assert_eq!(socket.state(), SocketState::Closed);

        assert!(!socket.mark_registered());
        socket.begin_close(ChangeCause::IdleTimeout);
        assert_eq!(socket.state(), SocketState::Closed);
        assert!(socket.open_exchange().is_err());
    }

    #[test]
    fn single_exchange_socket_is_consumed_by_its_exchange() {
        let socket = test_socket(ProtocolVersion::V1);
        socket.mark_registered();

        let exchange = socket.open_exchange().unwrap();
        assert_eq!(exchange.id, 0);

        socket.finish_exchange(exchange.id);
        assert_eq!(socket.state(), SocketState::Closing);
        assert!(!socket.is_selectable());
    }

    #[tokio::test]
    async fn closing_fails_in_flight_exchanges() {
        let socket = test_socket(ProtocolVersion::V2);
        socket.mark_registered();
        let mut exchange = socket.open_exchange().unwrap();

        socket.mark_closed();
        match exchange.events.recv().await {
            Some(ExchangeEvent::Broken) | None => {}
            other => panic!("expected broken exchange, got {other:?}"),
        }
    }

    #[test]
    fn exchange_ids_are_unique_within_the_socket() {
        let socket = test_socket(ProtocolVersion::V2);
        socket.mark_registered();
        let a = socket.open_exchange().unwrap();
        let b = socket.open_exchange().unwrap();
        assert_ne!(a.id, b.id);
    }
}
