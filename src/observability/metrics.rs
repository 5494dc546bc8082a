//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define tunnel metrics (exchanges, latency, socket counts)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `tunnel_exchanges_total` (counter): exchanges by route, status
//! - `tunnel_exchange_duration_seconds` (histogram): latency distribution
//! - `tunnel_sockets` (gauge): live tunnel sockets per route
//! - `tunnel_registrations_total` (counter): registrations by outcome

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a completed (or failed) proxied exchange.
pub fn record_exchange(route: &str, status: u16, start: Instant) {
    counter!(
        "tunnel_exchanges_total",
        "route" => route.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
    histogram!(
        "tunnel_exchange_duration_seconds",
        "route" => route.to_string(),
    )
    .record(start.elapsed().as_secs_f64());
}

/// Record the live socket count for a route after a registry change.
pub fn record_socket_count(route: &str, count: usize) {
    gauge!("tunnel_sockets", "route" => route.to_string()).set(count as f64);
}

/// Record a registration attempt outcome.
pub fn record_registration(outcome: &'static str) {
    counter!("tunnel_registrations_total", "outcome" => outcome).increment(1);
}
