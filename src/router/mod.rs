//! Router side: registry, dispatcher, registration endpoint, listeners.
//!
//! # Data Flow
//! ```text
//! connector ──▶ registration listener ──▶ registry (socket pools)
//! client ──▶ public listener ──▶ dispatcher ──▶ tunnel socket ──▶ connector
//! ```

pub mod dispatcher;
pub mod registration;
pub mod registry;
pub mod server;
pub mod socket;

pub use registry::{RouterRegistry, RegistryInfo};
pub use server::TunnelRouter;
pub use socket::{SocketState, TunnelSocket};
