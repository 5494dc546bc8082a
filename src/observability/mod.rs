//! Observability subsystem.
//!
//! Structured logging goes through `tracing` at the call sites; this
//! module only owns metric recording and the Prometheus exporter.

pub mod metrics;
