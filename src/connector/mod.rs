//! Connector side: registration client, socket plumbing, target forwarder.
//!
//! # Data Flow
//! ```text
//! supervisor ──▶ /register handshake ──▶ ConnectorSocket (read loop)
//!     ──▶ ReqHead ──▶ forwarder task ──▶ target service
//!     ◀── RspHead / RspBody / RspEnd ◀──
//! ```

pub mod client;
pub mod forwarder;
pub mod socket;

pub use client::{Connector, RouterUriProvider};
