//! Resilience helpers for tunnel reconnection.

pub mod backoff;

pub use backoff::calculate_backoff;
