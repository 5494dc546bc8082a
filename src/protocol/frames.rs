//! Frame definitions shared by both protocol versions.

use serde::{Deserialize, Serialize};

// Multiplexed (v2) binary frame layout: type(1) + exchange id(4 BE) + payload
pub const V2_HEADER_SIZE: usize = 5;

/// Frame type octets for the multiplexed protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    ReqHead = 0x01,
    ReqBody = 0x02,
    ReqEnd = 0x03,
    RspHead = 0x04,
    RspBody = 0x05,
    RspEnd = 0x06,
    Cancel = 0x07,
    WindowUpdate = 0x08,
    WsFrame = 0x09,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(FrameType::ReqHead),
            0x02 => Some(FrameType::ReqBody),
            0x03 => Some(FrameType::ReqEnd),
            0x04 => Some(FrameType::RspHead),
            0x05 => Some(FrameType::RspBody),
            0x06 => Some(FrameType::RspEnd),
            0x07 => Some(FrameType::Cancel),
            0x08 => Some(FrameType::WindowUpdate),
            0x09 => Some(FrameType::WsFrame),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Serialized head of a proxied request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHead {
    /// HTTP method, e.g. "GET".
    pub method: String,
    /// Path and query as received by the router, route segment included.
    pub target: String,
    /// End-to-end headers; hop-by-hop headers are stripped before framing.
    pub headers: Vec<(String, String)>,
    /// Whether body frames follow.
    pub body: bool,
    /// Whether this exchange is a WebSocket pass-through.
    pub ws: bool,
}

/// Serialized head of a proxied response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// One pass-through WebSocket frame, opaque to the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl WsFrame {
    pub fn opcode(&self) -> u8 {
        match self {
            WsFrame::Text(_) => 1,
            WsFrame::Binary(_) => 2,
            WsFrame::Close => 8,
            WsFrame::Ping(_) => 9,
            WsFrame::Pong(_) => 10,
        }
    }
}

/// A decoded tunnel frame, version-independent.
///
/// The exchange id is always 0 in the single-exchange protocol.
#[derive(Debug, Clone)]
pub enum TunnelFrame {
    ReqHead { id: u32, head: RequestHead },
    ReqBody { id: u32, chunk: Vec<u8> },
    ReqEnd { id: u32 },
    RspHead { id: u32, head: ResponseHead },
    RspBody { id: u32, chunk: Vec<u8> },
    RspEnd { id: u32 },
    Cancel { id: u32 },
    WindowUpdate { id: u32, credit: u32 },
    WsFrame { id: u32, frame: WsFrame },
}

impl TunnelFrame {
    pub fn exchange_id(&self) -> u32 {
        match self {
            TunnelFrame::ReqHead { id, .. }
            | TunnelFrame::ReqBody { id, .. }
            | TunnelFrame::ReqEnd { id }
            | TunnelFrame::RspHead { id, .. }
            | TunnelFrame::RspBody { id, .. }
            | TunnelFrame::RspEnd { id }
            | TunnelFrame::Cancel { id }
            | TunnelFrame::WindowUpdate { id, .. }
            | TunnelFrame::WsFrame { id, .. } => *id,
        }
    }
}

/// A WebSocket message ready for the wire, independent of which WebSocket
/// library carries it (the router uses axum's, the connector tungstenite).
#[derive(Debug, Clone)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Commands accepted by a socket's write task.
#[derive(Debug)]
pub enum WriteCmd {
    Frame(WireMessage),
    /// Close the transport after flushing queued frames.
    Shutdown,
}

/// Hop-by-hop headers stripped at the tunnel boundary (RFC 7230 §6.1).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}
