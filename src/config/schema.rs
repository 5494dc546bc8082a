//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the router
//! and connector processes. All types derive Serde traits for
//! deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolVersion;

/// Root configuration. A config file may carry both sections; each process
/// reads the one it needs.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TunnelConfig {
    /// Router-side settings (listeners, registry, dispatch).
    pub router: RouterConfig,

    /// Connector-side settings (routers, route, target, pool).
    pub connector: ConnectorConfig,

    /// Observability settings shared by both roles.
    pub observability: ObservabilityConfig,
}

/// Router process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Public listener for client traffic (e.g. "0.0.0.0:12002").
    pub public_bind: String,

    /// Registration listener connectors dial into (e.g. "0.0.0.0:12000").
    pub registration_bind: String,

    /// Protocol versions this router accepts, preference order.
    pub supported_versions: Vec<ProtocolVersion>,

    /// Sliding window: max in-flight exchanges per multiplexed socket.
    pub window_size: usize,

    /// Sockets idle longer than this are swept.
    pub idle_timeout_secs: u64,

    /// Cadence of the idle sweep timer.
    pub sweep_interval_secs: u64,

    /// Per-exchange timeout applied on the public listener.
    pub request_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            public_bind: "0.0.0.0:12002".to_string(),
            registration_bind: "0.0.0.0:12000".to_string(),
            supported_versions: vec![ProtocolVersion::V2, ProtocolVersion::V1],
            window_size: 4,
            idle_timeout_secs: 300,
            sweep_interval_secs: 30,
            request_timeout_secs: 30,
        }
    }
}

/// Connector process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Registration URIs of the routers to maintain pools against
    /// (e.g. "ws://router.internal:12000").
    pub routers: Vec<String>,

    /// Route this component serves.
    pub route: String,

    /// Component name advertised at registration.
    pub component: String,

    /// Base URI of the local target backend (e.g. "http://localhost:14444").
    pub target: String,

    /// Tunnel sockets to keep open per router. In the single-exchange
    /// protocol this is the route's true concurrency ceiling, so keep it
    /// above expected peak concurrent requests.
    pub pool_size: usize,

    /// Protocol versions to offer, preference order.
    pub preferred_versions: Vec<ProtocolVersion>,

    /// Base delay for reconnect backoff in milliseconds.
    pub backoff_base_ms: u64,

    /// Cap for reconnect backoff in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            routers: vec!["ws://localhost:12000".to_string()],
            route: "example".to_string(),
            component: "example".to_string(),
            target: "http://localhost:14444".to_string(),
            pool_size: 2,
            preferred_versions: vec![ProtocolVersion::V2, ProtocolVersion::V1],
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus scrape listener.
    pub metrics_enabled: bool,

    /// Bind address of the scrape listener.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
