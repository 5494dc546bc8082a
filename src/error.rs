//! Error taxonomy for the tunnel protocol core.
//!
//! Every failure in the system maps to one of these variants. Nothing is
//! swallowed: errors reach the client response, a broadcast event, or a log.

use thiserror::Error;

/// Errors produced by the tunnel protocol core.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Registration declined by policy or validation. Not retryable without
    /// a configuration change.
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    /// Transient failure establishing a tunnel socket. Retried with backoff.
    #[error("failed to connect to router {router}: {message}")]
    TunnelConnectFailure { router: String, message: String },

    /// The tunnel socket was lost while an exchange was in flight. The
    /// exchange fails and the socket transitions to Closing.
    #[error("tunnel socket closed mid-exchange")]
    TunnelBroken,

    /// No live tunnel sockets registered for the requested route.
    #[error("no connectors available for route '{0}'")]
    NoConnectorsAvailable(String),

    /// The connector could not reach its local target backend.
    #[error("target unreachable: {0}")]
    TargetUnreachable(String),

    /// Handshake found no mutually supported protocol version.
    #[error("no mutually supported protocol version (offered: {offered})")]
    ProtocolVersionMismatch { offered: String },

    /// A peer sent a frame the negotiated codec cannot interpret.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Underlying transport I/O failure outside an exchange.
    #[error("transport error: {0}")]
    Transport(String),
}
