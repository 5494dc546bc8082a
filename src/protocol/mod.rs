//! Wire protocol: versions, frames, and per-socket codecs.
//!
//! # Data Flow
//! ```text
//! Handshake:
//!     connector offers subprotocols → router picks highest supported
//!     → one codec instance bound to the socket for its lifetime
//!
//! Exchange:
//!     TunnelFrame → codec.encode → WireMessage → WebSocket message
//!     WebSocket message → WireMessage → codec.decode → TunnelFrame
//! ```
//!
//! # Design Decisions
//! - Version differences live entirely behind the codec; no version
//!   branching elsewhere in the codebase
//! - Request/response heads are JSON so both versions share one schema

pub mod codec;
pub mod frames;
pub mod version;

/// Handshake header naming the route a socket serves.
pub const ROUTE_HEADER: &str = "x-tunnel-route";
/// Handshake header naming the connector component; also stamped onto
/// forwarded requests so targets can see which component proxied them.
pub const COMPONENT_HEADER: &str = "x-tunnel-component";

pub use codec::{codec_for, CodecSide, TunnelCodec};
pub use frames::{RequestHead, ResponseHead, TunnelFrame, WireMessage, WsFrame};
pub use version::ProtocolVersion;
