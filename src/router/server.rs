//! Router listener setup.
//!
//! # Responsibilities
//! - Build the public axum app (catch-all dispatch by route segment)
//! - Build the registration axum app (/register, health endpoints)
//! - Wire middleware (tracing, request timeout)
//! - Serve both listeners with graceful, ordered shutdown
//!
//! The health endpoints are glue over [`RouterRegistry::collect_info`];
//! they never mutate registry state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{FromRequestParts, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::RouterConfig;
use crate::error::TunnelError;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::router::dispatcher::Dispatcher;
use crate::router::registration::{registration_handler, RegistrationState};
use crate::router::registry::{IpValidator, RouterRegistry};

/// Application state for the public listener.
#[derive(Clone)]
struct PublicState {
    dispatcher: Dispatcher,
    registry: Arc<RouterRegistry>,
}

/// The public-facing tunnel router: registry plus both listeners.
pub struct TunnelRouter {
    registry: Arc<RouterRegistry>,
    config: RouterConfig,
}

impl TunnelRouter {
    /// Create a router with the default accept-all registration policy.
    pub fn new(config: RouterConfig) -> Self {
        let registry = Arc::new(RouterRegistry::new(Duration::from_secs(
            config.idle_timeout_secs,
        )));
        Self { registry, config }
    }

    /// Create a router with a custom source-IP registration validator.
    pub fn with_validator(config: RouterConfig, validator: IpValidator) -> Self {
        let registry = Arc::new(RouterRegistry::with_validator(
            Duration::from_secs(config.idle_timeout_secs),
            validator,
        ));
        Self { registry, config }
    }

    pub fn registry(&self) -> Arc<RouterRegistry> {
        self.registry.clone()
    }

    /// Build the axum app served on the public listener.
    pub fn public_app(&self) -> Router {
        let state = PublicState {
            dispatcher: Dispatcher::new(self.registry.clone()),
            registry: self.registry.clone(),
        };
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.request_timeout_secs,
            )))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Build the axum app served on the registration listener.
    pub fn registration_app(&self) -> Router {
        let state = RegistrationState {
            registry: self.registry.clone(),
            supported_versions: self.config.supported_versions.clone(),
            window_size: self.config.window_size,
        };
        Router::new()
            .route("/register", any(registration_handler))
            .with_state(state)
            .route("/health", get(health_handler))
            .route("/health/connectors", get(connectors_handler))
            .with_state(self.registry.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve both listeners until shutdown triggers, then tear down in
    /// order: public listener, registration listener, registry timers.
    pub async fn run(
        self,
        public_listener: TcpListener,
        registration_listener: TcpListener,
        shutdown: &Shutdown,
    ) -> Result<(), std::io::Error> {
        tracing::info!(
            public = %public_listener.local_addr()?,
            registration = %registration_listener.local_addr()?,
            "Tunnel router starting"
        );

        self.registry.spawn_idle_sweeper(
            Duration::from_secs(self.config.sweep_interval_secs),
            shutdown.subscribe(),
        );

        let public_app = self
            .public_app()
            .into_make_service_with_connect_info::<SocketAddr>();
        let registration_app = self
            .registration_app()
            .into_make_service_with_connect_info::<SocketAddr>();

        let mut public_shutdown = shutdown.subscribe();
        let public = axum::serve(public_listener, public_app).with_graceful_shutdown(async move {
            let _ = public_shutdown.recv().await;
        });

        let mut registration_shutdown = shutdown.subscribe();
        let registration = axum::serve(registration_listener, registration_app)
            .with_graceful_shutdown(async move {
                let _ = registration_shutdown.recv().await;
            });

        let (public_result, registration_result) = tokio::join!(public, registration);
        public_result?;
        registration_result?;

        tracing::info!("Tunnel router stopped");
        Ok(())
    }
}

/// Catch-all handler on the public listener. The first path segment is
/// the route; the full path is forwarded to the target.
///
/// WebSocket upgrades are detected from the request headers rather than
/// an extractor, so plain HTTP requests take the same code path.
async fn proxy_handler(
    State(state): State<PublicState>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();
    let path = request.uri().path().to_string();

    let Some(route) = path.split('/').find(|s| !s.is_empty()).map(str::to_string) else {
        return (StatusCode::NOT_FOUND, "no route in path").into_response();
    };

    let (mut parts, body) = request.into_parts();
    tracing::debug!(route = %route, method = %parts.method, path = %path, "Dispatching exchange");

    if is_websocket_upgrade(&parts.headers) {
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => ws,
            Err(rejection) => return rejection.into_response(),
        };
        if state.registry.snapshot(&route).is_empty() {
            metrics::record_exchange(&route, 503, start);
            return (StatusCode::SERVICE_UNAVAILABLE, "no connectors available").into_response();
        }
        let dispatcher = state.dispatcher.clone();
        return ws.on_upgrade(move |client| async move {
            dispatcher.handle_websocket(&route, parts, client).await;
        });
    }

    match state.dispatcher.handle(&route, parts, body).await {
        Ok(response) => {
            metrics::record_exchange(&route, response.status().as_u16(), start);
            response.into_response()
        }
        Err(e) => {
            let status = match &e {
                TunnelError::NoConnectorsAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                TunnelError::TunnelBroken => StatusCode::BAD_GATEWAY,
                TunnelError::Protocol(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!(route = %route, error = %e, status = %status, "Exchange failed");
            metrics::record_exchange(&route, status.as_u16(), start);
            (status, e.to_string()).into_response()
        }
    }
}

/// True when the request asks to switch protocols to WebSocket.
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// `GET /health`: service map plus coarse connection statistics.
async fn health_handler(State(registry): State<Arc<RouterRegistry>>) -> Response {
    let info = registry.collect_info();
    let total_sockets: usize = info
        .routes
        .values()
        .flat_map(|components| components.values())
        .map(|c| c.socket_count)
        .sum();
    Json(serde_json::json!({
        "services": info,
        "activeSockets": total_sockets,
    }))
    .into_response()
}

/// `GET /health/connectors`: raw `collect_info()` output.
async fn connectors_handler(State(registry): State<Arc<RouterRegistry>>) -> Response {
    Json(registry.collect_info()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn upgrade_header_detection_ignores_case() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
    }
}
