//! Connector registration client.
//!
//! # Responsibilities
//! - Keep `pool_size` registered tunnel sockets per router URI
//! - Reconnect lost sockets with exponential backoff and jitter
//! - Offer protocol versions in preference order during the handshake
//! - Drain in-flight exchanges on `stop`, then force-close
//!
//! # Design Decisions
//! - A single supervisor task tops pools up on a short tick instead of
//!   per-socket respawn chains; the router URI provider is re-invoked on
//!   every tick so dynamic router sets are picked up without restarts.
//! - Single-exchange sockets are consumed by their exchange; the next
//!   supervisor tick replaces them, which is the replenishment path.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as TtMessage;

use crate::config::ConnectorConfig;
use crate::error::TunnelError;
use crate::events::ConnectorEvent;
use crate::lifecycle::Shutdown;
use crate::protocol::frames::{WireMessage, WriteCmd};
use crate::protocol::{
    codec_for, CodecSide, ProtocolVersion, TunnelFrame, COMPONENT_HEADER, ROUTE_HEADER,
};
use crate::resilience::calculate_backoff;

use super::forwarder::Forwarder;
use super::socket::ConnectorSocket;

/// Produces the router URIs to register with; re-invoked on every
/// supervisor tick.
pub type RouterUriProvider = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// How often the supervisor reconciles socket pools with the router list.
const SUPERVISOR_TICK: Duration = Duration::from_millis(250);

/// Depth of the write queue feeding each socket's transport.
const WRITE_QUEUE_DEPTH: usize = 64;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Per-router pool bookkeeping.
#[derive(Default)]
struct RouterPool {
    sockets: AtomicUsize,
    consecutive_failures: AtomicU32,
}

struct ConnectorShared {
    config: ConnectorConfig,
    provider: RouterUriProvider,
    events: broadcast::Sender<ConnectorEvent>,
    shutdown: Shutdown,
    accepting: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    forwarder: Arc<Forwarder>,
    pools: DashMap<String, Arc<RouterPool>>,
}

/// A running connector: registration sockets to one or more routers,
/// forwarding tunneled exchanges to a single local target.
pub struct Connector {
    inner: Arc<ConnectorShared>,
}

impl Connector {
    /// Start a connector against the fixed router list in `config`.
    pub fn start(config: ConnectorConfig) -> Self {
        let routers = config.routers.clone();
        Self::start_with_provider(config, Arc::new(move || routers.clone()))
    }

    /// Start a connector with a dynamic router URI provider.
    pub fn start_with_provider(config: ConnectorConfig, provider: RouterUriProvider) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let accepting = Arc::new(AtomicBool::new(true));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let forwarder = Arc::new(Forwarder::new(
            config.target.clone(),
            config.component.clone(),
            events.clone(),
            in_flight.clone(),
            accepting.clone(),
        ));
        let inner = Arc::new(ConnectorShared {
            config,
            provider,
            events,
            shutdown: Shutdown::new(),
            accepting,
            in_flight,
            forwarder,
            pools: DashMap::new(),
        });

        tokio::spawn(run_supervisor(inner.clone()));
        Self { inner }
    }

    /// Subscribe to connection and forwarding events.
    pub fn events(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.inner.events.subscribe()
    }

    /// Total registered sockets across all routers.
    pub fn socket_count(&self) -> usize {
        self.inner
            .pools
            .iter()
            .map(|p| p.sockets.load(Ordering::SeqCst))
            .sum()
    }

    /// Exchanges currently being forwarded to the target.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting exchanges, wait up to `timeout` for in-flight ones
    /// to finish, then close every socket. Returns `true` if the drain
    /// completed before the deadline.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.inner.accepting.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + timeout;
        while self.inner.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let drained = self.inner.in_flight.load(Ordering::SeqCst) == 0;

        self.inner.shutdown.trigger();
        tracing::info!(drained, "Connector stopped");
        drained
    }
}

/// Reconcile socket pools with the router list until shutdown.
async fn run_supervisor(inner: Arc<ConnectorShared>) {
    let mut shutdown_rx = inner.shutdown.subscribe();
    loop {
        if !inner.accepting.load(Ordering::SeqCst) {
            break;
        }

        let uris = (inner.provider)();
        for uri in &uris {
            top_up(&inner, uri);
        }
        drop_stale_pools(&inner, &uris);

        tokio::select! {
            _ = tokio::time::sleep(SUPERVISOR_TICK) => {}
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Spawn socket tasks until this router's pool is at `pool_size`.
fn top_up(inner: &Arc<ConnectorShared>, uri: &str) {
    let pool = inner
        .pools
        .entry(uri.to_string())
        .or_insert_with(|| Arc::new(RouterPool::default()))
        .clone();

    while pool.sockets.load(Ordering::SeqCst) < inner.config.pool_size {
        pool.sockets.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(run_socket(inner.clone(), uri.to_string(), pool.clone()));
    }
}

/// Forget pools for routers the provider no longer lists. Their live
/// sockets keep serving until they close; they are just not replaced.
fn drop_stale_pools(inner: &Arc<ConnectorShared>, uris: &[String]) {
    let stale: Vec<String> = inner
        .pools
        .iter()
        .filter(|p| p.sockets.load(Ordering::SeqCst) == 0 && !uris.contains(p.key()))
        .map(|p| p.key().clone())
        .collect();
    for uri in stale {
        inner.pools.remove(&uri);
    }
}

/// One socket attempt: back off if the last attempts failed, connect,
/// then serve frames until the transport ends.
async fn run_socket(inner: Arc<ConnectorShared>, uri: String, pool: Arc<RouterPool>) {
    let failures = pool.consecutive_failures.load(Ordering::SeqCst);
    if failures > 0 {
        let delay = calculate_backoff(
            failures,
            inner.config.backoff_base_ms,
            inner.config.backoff_max_ms,
        );
        let mut shutdown_rx = inner.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.recv() => {
                pool.sockets.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
    }

    match connect(&inner, &uri).await {
        Ok((socket, stream, writer_rx)) => {
            pool.consecutive_failures.store(0, Ordering::SeqCst);
            emit_registration(&inner, &uri, true, pool.sockets.load(Ordering::SeqCst));
            serve_socket(&inner, socket, stream, writer_rx).await;
            let remaining = pool.sockets.fetch_sub(1, Ordering::SeqCst) - 1;
            emit_registration(&inner, &uri, false, remaining);
        }
        Err(e) => {
            pool.consecutive_failures.fetch_add(1, Ordering::SeqCst);
            pool.sockets.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(router = %uri, error = %e, "Tunnel socket connect failed");
            let _ = inner.events.send(ConnectorEvent::SocketConnectionError {
                router: uri,
                error: e.to_string(),
            });
        }
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Perform the registration handshake against one router.
async fn connect(
    inner: &Arc<ConnectorShared>,
    uri: &str,
) -> Result<(Arc<ConnectorSocket>, WsStream, mpsc::Receiver<WriteCmd>), TunnelError> {
    let url = format!("{}/register", uri.trim_end_matches('/'));
    let mut request = url
        .into_client_request()
        .map_err(|e| TunnelError::TunnelConnectFailure {
            router: uri.to_string(),
            message: e.to_string(),
        })?;

    let offered: Vec<&str> = inner
        .config
        .preferred_versions
        .iter()
        .map(|v| v.subprotocol())
        .collect();
    let headers = request.headers_mut();
    headers.insert(
        ROUTE_HEADER,
        header_value(&inner.config.route, uri)?,
    );
    headers.insert(
        COMPONENT_HEADER,
        header_value(&inner.config.component, uri)?,
    );
    headers.insert(
        "sec-websocket-protocol",
        header_value(&offered.join(", "), uri)?,
    );

    let (stream, response) =
        connect_async(request)
            .await
            .map_err(|e| TunnelError::TunnelConnectFailure {
                router: uri.to_string(),
                message: e.to_string(),
            })?;

    let negotiated = response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .and_then(ProtocolVersion::from_subprotocol)
        .ok_or_else(|| TunnelError::ProtocolVersionMismatch {
            offered: offered.join(", "),
        })?;

    tracing::info!(
        router = %uri,
        route = %inner.config.route,
        version = %negotiated.subprotocol(),
        "Tunnel socket registered"
    );

    let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let socket = Arc::new(ConnectorSocket::new(
        uri.to_string(),
        negotiated,
        codec_for(negotiated, CodecSide::Connector),
        writer_tx,
    ));
    Ok((socket, stream, writer_rx))
}

fn header_value(value: &str, uri: &str) -> Result<HeaderValue, TunnelError> {
    HeaderValue::from_str(value).map_err(|e| TunnelError::TunnelConnectFailure {
        router: uri.to_string(),
        message: format!("invalid header value: {e}"),
    })
}

/// Drive one registered socket: write task plus read loop.
async fn serve_socket(
    inner: &Arc<ConnectorShared>,
    socket: Arc<ConnectorSocket>,
    stream: WsStream,
    writer_rx: mpsc::Receiver<WriteCmd>,
) {
    let (ws_tx, mut ws_rx) = stream.split();
    let write_task = tokio::spawn(run_write_task(ws_tx, writer_rx));

    let mut shutdown_rx = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(TtMessage::Text(text))) => {
                    dispatch(inner, &socket, WireMessage::Text(text.to_string())).await;
                }
                Some(Ok(TtMessage::Binary(data))) => {
                    dispatch(inner, &socket, WireMessage::Binary(data.to_vec())).await;
                }
                Some(Ok(TtMessage::Ping(_))) | Some(Ok(TtMessage::Pong(_))) => {}
                Some(Ok(TtMessage::Frame(_))) => {}
                Some(Ok(TtMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(router = %socket.router, error = %e, "Tunnel transport error");
                    break;
                }
            },
            _ = shutdown_rx.recv() => {
                socket.shutdown_transport();
                break;
            }
        }
    }

    socket.fail_all_exchanges();
    write_task.abort();
}

/// Decode and route one wire message.
async fn dispatch(inner: &Arc<ConnectorShared>, socket: &Arc<ConnectorSocket>, msg: WireMessage) {
    match socket.decode(msg) {
        Ok(TunnelFrame::ReqHead { id, head }) => {
            inner.forwarder.spawn_exchange(socket.clone(), id, head);
        }
        Ok(frame) => socket.route_frame(frame).await,
        Err(e) => {
            tracing::warn!(router = %socket.router, error = %e, "Undecodable tunnel frame");
        }
    }
}

async fn run_write_task(
    mut ws_tx: futures_util::stream::SplitSink<WsStream, TtMessage>,
    mut writer_rx: mpsc::Receiver<WriteCmd>,
) {
    while let Some(cmd) = writer_rx.recv().await {
        match cmd {
            WriteCmd::Frame(WireMessage::Text(text)) => {
                if ws_tx.send(TtMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            WriteCmd::Frame(WireMessage::Binary(data)) => {
                if ws_tx.send(TtMessage::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            WriteCmd::Shutdown => break,
        }
    }
    let _ = ws_tx.close().await;
}

fn emit_registration(inner: &Arc<ConnectorShared>, uri: &str, connected: bool, socket_count: usize) {
    let _ = inner.events.send(ConnectorEvent::RegistrationChanged {
        router: uri.to_string(),
        route: inner.config.route.clone(),
        component: inner.config.component.clone(),
        connected,
        socket_count,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_list_is_reinvoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let provider: RouterUriProvider = Arc::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            vec!["ws://localhost:12000".to_string()]
        });
        assert_eq!((provider)(), vec!["ws://localhost:12000".to_string()]);
        assert_eq!((provider)().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_pools_with_live_sockets_are_kept() {
        let pools: DashMap<String, Arc<RouterPool>> = DashMap::new();
        let live = Arc::new(RouterPool::default());
        live.sockets.store(1, Ordering::SeqCst);
        pools.insert("ws://a".to_string(), live);
        pools.insert("ws://b".to_string(), Arc::new(RouterPool::default()));

        let keep: Vec<String> = vec!["ws://c".to_string()];
        let stale: Vec<String> = pools
            .iter()
            .filter(|p| p.sockets.load(Ordering::SeqCst) == 0 && !keep.contains(p.key()))
            .map(|p| p.key().clone())
            .collect();
        assert_eq!(stale, vec!["ws://b".to_string()]);
    }
}
