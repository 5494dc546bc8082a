//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown:
//!     Signal received → stop accepting client requests
//!     → drain in-flight exchanges (bounded by timeout)
//!     → close tunnel sockets → stop registry timers
//! ```
//!
//! # Design Decisions
//! - Ordered teardown: public listener, registration listener, registry
//! - Connect retries subscribe to the shutdown channel so unbounded
//!   backoff loops stay cancellable

pub mod shutdown;

pub use shutdown::Shutdown;
