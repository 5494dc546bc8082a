//! Tagged event types delivered over broadcast channels.
//!
//! # Responsibilities
//! - Describe registry socket-set changes (router side)
//! - Describe connection and proxy outcomes (connector side)
//!
//! # Design Decisions
//! - A fixed set of enum variants instead of listener trait hierarchies
//! - Events are immutable values, cheap to clone for broadcast fan-out

/// Why a route's socket set changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    /// A new tunnel socket was accepted.
    Registered,
    /// A socket was explicitly deregistered.
    Deregistered,
    /// The idle sweep removed a socket past the idle timeout.
    IdleTimeout,
    /// The underlying transport closed or errored.
    SocketClosed,
}

/// Emitted by the router registry whenever a route's socket set changes.
#[derive(Debug, Clone)]
pub struct RegistrationChangeEvent {
    pub route: String,
    pub component: String,
    pub previous_count: usize,
    pub new_count: usize,
    pub cause: ChangeCause,
}

/// Events observable from a running connector.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    /// A tunnel socket to a router was established or lost.
    RegistrationChanged {
        router: String,
        route: String,
        component: String,
        connected: bool,
        socket_count: usize,
    },
    /// A connect attempt to a router failed.
    SocketConnectionError { router: String, error: String },
    /// Forwarding an exchange to the target failed.
    ProxyError {
        method: String,
        target: String,
        error: String,
    },
}
