//! Shared utilities for tunnel integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::Router;
use tokio::net::TcpListener;

use tunnel_proxy::config::{ConnectorConfig, RouterConfig};
use tunnel_proxy::protocol::ProtocolVersion;
use tunnel_proxy::router::RouterRegistry;
use tunnel_proxy::{Connector, Shutdown, TunnelRouter};

/// Start a mock target service on `addr`:
/// - `GET /example/hello` → "Hi there!"
/// - `POST /example/reflect` → echoes the request body
/// - `GET /example/echo` (WebSocket) → "ECHO BACK: {text}"
/// - `GET /example/slow` → "finally" after a 2s delay
pub async fn start_target(addr: SocketAddr) {
    let app = Router::new()
        .route("/example/hello", get(|| async { "Hi there!" }))
        .route("/example/reflect", post(|body: String| async move { body }))
        .route("/example/echo", any(echo_upgrade))
        .route(
            "/example/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "finally"
            }),
        );
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
}

async fn echo_upgrade(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(echo_socket)
}

async fn echo_socket(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                let reply = format!("ECHO BACK: {text}");
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }
            Message::Binary(data) => {
                if socket.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Start a tunnel router on the given listeners. Returns the shutdown
/// handle (trigger to stop) and the registry for inspection.
pub async fn start_router(
    public: SocketAddr,
    registration: SocketAddr,
    supported_versions: Vec<ProtocolVersion>,
) -> (Arc<Shutdown>, Arc<RouterRegistry>) {
    let config = RouterConfig {
        public_bind: public.to_string(),
        registration_bind: registration.to_string(),
        supported_versions,
        ..RouterConfig::default()
    };
    let router = TunnelRouter::new(config);
    let registry = router.registry();

    let public_listener = TcpListener::bind(public).await.unwrap();
    let registration_listener = TcpListener::bind(registration).await.unwrap();

    let shutdown = Arc::new(Shutdown::new());
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        let _ = router
            .run(public_listener, registration_listener, &shutdown_clone)
            .await;
    });

    (shutdown, registry)
}

/// Start a connector registering `route`/"example" against one router.
pub fn start_connector(
    registration: SocketAddr,
    target: SocketAddr,
    pool_size: usize,
    preferred_versions: Vec<ProtocolVersion>,
) -> Connector {
    let config = ConnectorConfig {
        routers: vec![format!("ws://{registration}")],
        route: "example".to_string(),
        component: "example".to_string(),
        target: format!("http://{target}"),
        pool_size,
        preferred_versions,
        backoff_base_ms: 100,
        backoff_max_ms: 1_000,
    };
    Connector::start(config)
}

/// Poll until `cond` holds or the timeout elapses; panics on timeout.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Wait until the registry holds at least `count` selectable sockets for
/// "example".
#[allow(dead_code)]
pub async fn wait_for_sockets(registry: &Arc<RouterRegistry>, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.snapshot("example").len() < count {
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "timed out waiting for {count} registered sockets (have {})",
                registry.snapshot("example").len()
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
