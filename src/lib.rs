//! Tunnel Reverse Proxy Library
//!
//! A reverse proxy where connections are established "backwards": connectors
//! running next to target services dial out to the router and register
//! long-lived WebSocket tunnel sockets. Client requests arriving at the
//! router are dispatched over those sockets, so targets never need inbound
//! connectivity.
//!
//! # Architecture Overview
//!
//! ```text
//!    Client Request           ROUTER                        CONNECTOR
//!    ──────────────▶ ┌──────────────────────┐      ┌──────────────────────┐
//!                    │ public listener      │      │ registration client  │
//!                    │   │                  │      │   │ (dials out)      │
//!                    │   ▼                  │      │   ▼                  │
//!                    │ dispatcher ──▶ socket│◀════▶│ socket ──▶ forwarder │──▶ Target
//!                    │   ▲            pools │ WS   │              (hyper) │    Service
//!                    │   │                  │      │                      │
//!                    │ registry ◀── /register ─────│ supervisor + backoff │
//!                    └──────────────────────┘      └──────────────────────┘
//!
//!    Cross-cutting: config, flow control, protocol codecs, events,
//!    lifecycle (shutdown), observability, resilience (backoff)
//! ```

// Core subsystems
pub mod config;
pub mod connector;
pub mod protocol;
pub mod router;

// Exchange plumbing
pub mod error;
pub mod events;
pub mod flow;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::TunnelConfig;
pub use connector::Connector;
pub use error::TunnelError;
pub use lifecycle::Shutdown;
pub use router::TunnelRouter;
