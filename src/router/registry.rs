//! Route registration tracking.
//!
//! # Responsibilities
//! - Track live tunnel sockets per route, grouped by component
//! - Validate registrations (route name, source-IP policy hook)
//! - Sweep idle sockets on a timer independent of the request path
//! - Broadcast a change event for every socket-set mutation
//!
//! # Concurrency
//! Mutations (register/deregister/sweep) serialize on a mutex and publish
//! a freshly built map through `ArcSwap`, so `snapshot` readers never
//! lock. The dispatcher calls `snapshot` on every inbound request.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::validation::is_valid_route_name;
use crate::error::TunnelError;
use crate::events::{ChangeCause, RegistrationChangeEvent};
use crate::observability::metrics;
use crate::router::socket::TunnelSocket;

/// Source-IP policy hook consulted before accepting a registration.
pub type IpValidator = Arc<dyn Fn(IpAddr) -> bool + Send + Sync>;

type RouteMap = HashMap<String, Vec<Arc<TunnelSocket>>>;

/// Router-side registry of tunnel sockets.
pub struct RouterRegistry {
    routes: ArcSwap<RouteMap>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<RegistrationChangeEvent>,
    validator: IpValidator,
    idle_timeout: Duration,
}

impl RouterRegistry {
    /// Create a registry with the default accept-all IP validator.
    pub fn new(idle_timeout: Duration) -> Self {
        Self::with_validator(idle_timeout, Arc::new(|_| true))
    }

    pub fn with_validator(idle_timeout: Duration, validator: IpValidator) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            routes: ArcSwap::from_pointee(RouteMap::new()),
            write_lock: Mutex::new(()),
            events,
            validator,
            idle_timeout,
        }
    }

    /// Subscribe to socket-set change events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistrationChangeEvent> {
        self.events.subscribe()
    }

    /// Policy checks run before the WebSocket upgrade is accepted.
    pub fn validate_registration(&self, peer: IpAddr, route: &str) -> Result<(), TunnelError> {
        if !is_valid_route_name(route) {
            metrics::record_registration("rejected");
            return Err(TunnelError::RegistrationRejected(format!(
                "malformed route name '{route}'"
            )));
        }
        if !(self.validator)(peer) {
            metrics::record_registration("rejected");
            return Err(TunnelError::RegistrationRejected(format!(
                "peer address {peer} declined by policy"
            )));
        }
        Ok(())
    }

    /// Add an accepted socket to its route's pool and emit a change event.
    pub fn register(&self, socket: Arc<TunnelSocket>, peer: IpAddr) -> Result<(), TunnelError> {
        self.validate_registration(peer, &socket.route)?;
        if !socket.mark_registered() {
            return Err(TunnelError::RegistrationRejected(
                "socket is no longer in the connecting state".into(),
            ));
        }

        let (previous_count, new_count);
        {
            let _guard = self.write_lock.lock().expect("registry lock poisoned");
            let mut map = RouteMap::clone(&self.routes.load());
            let pool = map.entry(socket.route.clone()).or_default();
            previous_count = pool.len();
            insert_grouped(pool, socket.clone());
            new_count = pool.len();
            self.routes.store(Arc::new(map));
        }

        metrics::record_registration("accepted");
        metrics::record_socket_count(&socket.route, new_count);
        tracing::info!(
            route = %socket.route,
            component = %socket.component,
            socket_id = %socket.id,
            version = %socket.version(),
            sockets = new_count,
            "Tunnel socket registered"
        );
        self.emit(&socket, previous_count, new_count, ChangeCause::Registered);
        Ok(())
    }

    /// Idempotent removal. Emits exactly one change event per socket that
    /// was actually present.
    pub fn deregister(&self, socket: &Arc<TunnelSocket>, cause: ChangeCause) -> bool {
        let (previous_count, new_count);
        {
            let _guard = self.write_lock.lock().expect("registry lock poisoned");
            let current = self.routes.load();
            let Some(pool) = current.get(&socket.route) else {
                return false;
            };
            if !pool.iter().any(|s| s.id == socket.id) {
                return false;
            }

            let mut map = RouteMap::clone(&current);
            let pool = map.get_mut(&socket.route).expect("route checked above");
            previous_count = pool.len();
            pool.retain(|s| s.id != socket.id);
            new_count = pool.len();
            if pool.is_empty() {
                map.remove(&socket.route);
            }
            self.routes.store(Arc::new(map));
        }

        metrics::record_socket_count(&socket.route, new_count);
        tracing::info!(
            route = %socket.route,
            component = %socket.component,
            socket_id = %socket.id,
            cause = ?cause,
            sockets = new_count,
            "Tunnel socket deregistered"
        );
        self.emit(socket, previous_count, new_count, cause);
        true
    }

    /// Remove sockets whose last activity exceeds the idle timeout,
    /// closing their transports. Runs on its own timer task so the
    /// dispatcher's read/write path never pays for it.
    ///
    /// Sockets with in-flight exchanges are never swept: activity is only
    /// stamped on inbound frames, so a long client-to-target-only exchange
    /// would otherwise look idle from the router's side.
    pub fn idle_sweep(&self) {
        let stale: Vec<Arc<TunnelSocket>> = self
            .routes
            .load()
            .values()
            .flatten()
            .filter(|s| s.in_flight() == 0 && s.idle_for() > self.idle_timeout)
            .cloned()
            .collect();

        for socket in stale {
            tracing::info!(
                route = %socket.route,
                socket_id = %socket.id,
                idle_secs = socket.idle_for().as_secs(),
                "Sweeping idle tunnel socket"
            );
            socket.begin_close(ChangeCause::IdleTimeout);
            self.deregister(&socket, ChangeCause::IdleTimeout);
        }
    }

    /// Spawn the periodic idle sweeper, cancelled by the shutdown channel.
    pub fn spawn_idle_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.idle_sweep(),
                    _ = shutdown.recv() => break,
                }
            }
            tracing::debug!("Idle sweeper stopped");
        });
    }

    /// Point-in-time view of a route's live sockets. Sockets that have
    /// reached `Closed` are filtered even if a removal is still in flight.
    pub fn snapshot(&self, route: &str) -> Vec<Arc<TunnelSocket>> {
        self.routes
            .load()
            .get(route)
            .map(|pool| pool.iter().filter(|s| !s.is_closed()).cloned().collect())
            .unwrap_or_default()
    }

    /// Read-only info for health reporting. Never blocks writers.
    pub fn collect_info(&self) -> RegistryInfo {
        let mut routes: BTreeMap<String, BTreeMap<String, ComponentInfo>> = BTreeMap::new();
        for (route, pool) in self.routes.load().iter() {
            let components = routes.entry(route.clone()).or_default();
            for socket in pool {
                let info = components
                    .entry(socket.component.clone())
                    .or_insert_with(ComponentInfo::default);
                info.socket_count += 1;
                info.sockets.push(SocketInfo {
                    id: socket.id.to_string(),
                    version: socket.version().subprotocol(),
                    age_secs: socket.age().as_secs(),
                    in_flight: socket.in_flight(),
                });
            }
        }
        RegistryInfo { routes }
    }

    fn emit(
        &self,
        socket: &Arc<TunnelSocket>,
        previous_count: usize,
        new_count: usize,
        cause: ChangeCause,
    ) {
        let _ = self.events.send(RegistrationChangeEvent {
            route: socket.route.clone(),
            component: socket.component.clone(),
            previous_count,
            new_count,
            cause,
        });
    }
}

/// Keep each route's pool contiguous by component so selection interleaves
/// components fairly.
fn insert_grouped(pool: &mut Vec<Arc<TunnelSocket>>, socket: Arc<TunnelSocket>) {
    let insert_at = pool
        .iter()
        .rposition(|s| s.component == socket.component)
        .map(|i| i + 1)
        .unwrap_or(pool.len());
    pool.insert(insert_at, socket);
}

/// Per-route, per-component socket summary for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryInfo {
    pub routes: BTreeMap<String, BTreeMap<String, ComponentInfo>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ComponentInfo {
    pub socket_count: usize,
    pub sockets: Vec<SocketInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SocketInfo {
    pub id: String,
    pub version: &'static str,
    pub age_secs: u64,
    pub in_flight: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{codec_for, CodecSide, ProtocolVersion};
    use tokio::sync::mpsc;

    fn test_socket(route: &str, component: &str) -> Arc<TunnelSocket> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(TunnelSocket::new(
            route.into(),
            component.into(),
            ProtocolVersion::V2,
            codec_for(ProtocolVersion::V2, CodecSide::Router),
            4,
            tx,
        ))
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn register_then_snapshot_returns_the_socket() {
        let registry = RouterRegistry::new(Duration::from_secs(300));
        let socket = test_socket("example", "example-1");
        registry.register(socket.clone(), localhost()).unwrap();

        let snapshot = registry.snapshot("example");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, socket.id);
        assert!(registry.snapshot("other").is_empty());
    }

    #[test]
    fn malformed_route_is_rejected() {
        let registry = RouterRegistry::new(Duration::from_secs(300));
        let socket = test_socket("bad route", "c");
        let err = registry.register(socket, localhost()).unwrap_err();
        assert!(matches!(err, TunnelError::RegistrationRejected(_)));
    }

    #[test]
    fn ip_validator_declines_registration() {
        let registry =
            RouterRegistry::with_validator(Duration::from_secs(300), Arc::new(|_| false));
        let socket = test_socket("example", "c");
        let err = registry.register(socket, localhost()).unwrap_err();
        assert!(matches!(err, TunnelError::RegistrationRejected(_)));
    }

    #[test]
    fn double_deregister_emits_exactly_one_event() {
        let registry = RouterRegistry::new(Duration::from_secs(300));
        let mut events = registry.subscribe();
        let socket = test_socket("example", "c");
        registry.register(socket.clone(), localhost()).unwrap();

        assert!(registry.deregister(&socket, ChangeCause::Deregistered));
        assert!(!registry.deregister(&socket, ChangeCause::Deregistered));

        // One Registered event, one Deregistered event, nothing more.
        let first = events.try_recv().unwrap();
        assert_eq!(first.cause, ChangeCause::Registered);
        let second = events.try_recv().unwrap();
        assert_eq!(second.cause, ChangeCause::Deregistered);
        assert_eq!(second.previous_count, 1);
        assert_eq!(second.new_count, 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn snapshot_never_returns_closed_sockets() {
        let registry = RouterRegistry::new(Duration::from_secs(300));
        let socket = test_socket("example", "c");
        registry.register(socket.clone(), localhost()).unwrap();

        socket.mark_closed();
        assert!(registry.snapshot("example").is_empty());
    }

    #[tokio::test]
    async fn idle_sweep_removes_stale_sockets() {
        let registry = RouterRegistry::new(Duration::from_millis(1));
        let mut events = registry.subscribe();
        let socket = test_socket("example", "c");
        registry.register(socket.clone(), localhost()).unwrap();
        let _ = events.try_recv();

        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.idle_sweep();

        assert!(registry.snapshot("example").is_empty());
        let event = events.try_recv().unwrap();
        assert_eq!(event.cause, ChangeCause::IdleTimeout);
    }

    #[tokio::test]
    async fn idle_sweep_spares_sockets_with_in_flight_exchanges() {
        let registry = RouterRegistry::new(Duration::from_millis(1));
        let socket = test_socket("example", "c");
        registry.register(socket.clone(), localhost()).unwrap();

        // A one-way exchange produces no inbound frames, so the socket
        // looks idle while the window slot is held.
        let slot = socket.window().try_acquire().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.idle_sweep();
        assert_eq!(registry.snapshot("example").len(), 1);

        drop(slot);
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.idle_sweep();
        assert!(registry.snapshot("example").is_empty());
    }

    #[test]
    fn collect_info_groups_by_route_and_component() {
        let registry = RouterRegistry::new(Duration::from_secs(300));
        registry
            .register(test_socket("example", "a"), localhost())
            .unwrap();
        registry
            .register(test_socket("example", "a"), localhost())
            .unwrap();
        registry
            .register(test_socket("billing", "b"), localhost())
            .unwrap();

        let info = registry.collect_info();
        assert_eq!(info.routes["example"]["a"].socket_count, 2);
        assert_eq!(info.routes["billing"]["b"].socket_count, 1);
    }

    #[test]
    fn pools_stay_grouped_by_component() {
        let registry = RouterRegistry::new(Duration::from_secs(300));
        registry
            .register(test_socket("example", "a"), localhost())
            .unwrap();
        registry
            .register(test_socket("example", "b"), localhost())
            .unwrap();
        registry
            .register(test_socket("example", "a"), localhost())
            .unwrap();

        let components: Vec<String> = registry
            .snapshot("example")
            .iter()
            .map(|s| s.component.clone())
            .collect();
        assert_eq!(components, vec!["a", "a", "b"]);
    }
}
