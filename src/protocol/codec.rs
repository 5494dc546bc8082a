//! Per-socket codecs for the two wire protocol versions.
//!
//! A codec is selected once at handshake time and bound to the socket for
//! its lifetime; everything above this module speaks [`TunnelFrame`].

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::TunnelError;
use crate::protocol::frames::{
    FrameType, RequestHead, ResponseHead, TunnelFrame, WireMessage, WsFrame, V2_HEADER_SIZE,
};
use crate::protocol::version::ProtocolVersion;

/// Which end of the tunnel a codec instance decodes for. The
/// single-exchange protocol reuses the same frame shapes in both
/// directions, so the decoder needs to know which direction it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecSide {
    Router,
    Connector,
}

/// Encodes and decodes tunnel frames for one negotiated version.
pub trait TunnelCodec: Send + Sync {
    fn version(&self) -> ProtocolVersion;

    fn encode(&self, frame: &TunnelFrame) -> Result<WireMessage, TunnelError>;

    fn decode(&self, msg: WireMessage) -> Result<TunnelFrame, TunnelError>;
}

/// Build the codec for a negotiated version.
pub fn codec_for(version: ProtocolVersion, side: CodecSide) -> Box<dyn TunnelCodec> {
    match version {
        ProtocolVersion::V1 => Box::new(SingleExchangeCodec::new(side)),
        ProtocolVersion::V2 => Box::new(MultiplexedCodec),
    }
}

const V1_END: &str = "END";
const V1_CANCEL: &str = "CANCEL";

/// `tunnel-v1`: one exchange per socket.
///
/// Heads travel as Text frames holding JSON, body bytes as raw Binary
/// frames, and `END`/`CANCEL` as Text markers. Once a WebSocket
/// pass-through head goes by, Binary frames switch to `[opcode][payload]`
/// pass-through encoding for the rest of the socket's life.
struct SingleExchangeCodec {
    side: CodecSide,
    ws_mode: AtomicBool,
}

impl SingleExchangeCodec {
    fn new(side: CodecSide) -> Self {
        Self {
            side,
            ws_mode: AtomicBool::new(false),
        }
    }

    fn ws_mode(&self) -> bool {
        self.ws_mode.load(Ordering::Acquire)
    }
}

impl TunnelCodec for SingleExchangeCodec {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V1
    }

    fn encode(&self, frame: &TunnelFrame) -> Result<WireMessage, TunnelError> {
        match frame {
            TunnelFrame::ReqHead { head, .. } => {
                if head.ws {
                    self.ws_mode.store(true, Ordering::Release);
                }
                Ok(WireMessage::Text(encode_json(head)?))
            }
            TunnelFrame::RspHead { head, .. } => Ok(WireMessage::Text(encode_json(head)?)),
            TunnelFrame::ReqBody { chunk, .. } | TunnelFrame::RspBody { chunk, .. } => {
                Ok(WireMessage::Binary(chunk.clone()))
            }
            TunnelFrame::ReqEnd { .. } | TunnelFrame::RspEnd { .. } => {
                Ok(WireMessage::Text(V1_END.to_string()))
            }
            TunnelFrame::Cancel { .. } => Ok(WireMessage::Text(V1_CANCEL.to_string())),
            TunnelFrame::WsFrame { frame, .. } => Ok(WireMessage::Binary(encode_ws_payload(frame))),
            TunnelFrame::WindowUpdate { .. } => Err(TunnelError::Protocol(
                "window updates are not part of the single-exchange protocol".into(),
            )),
        }
    }

    fn decode(&self, msg: WireMessage) -> Result<TunnelFrame, TunnelError> {
        match msg {
            WireMessage::Text(text) => match text.as_str() {
                V1_END => Ok(match self.side {
                    CodecSide::Router => TunnelFrame::RspEnd { id: 0 },
                    CodecSide::Connector => TunnelFrame::ReqEnd { id: 0 },
                }),
                V1_CANCEL => Ok(TunnelFrame::Cancel { id: 0 }),
                json => match self.side {
                    CodecSide::Router => {
                        let head: ResponseHead = decode_json(json)?;
                        Ok(TunnelFrame::RspHead { id: 0, head })
                    }
                    CodecSide::Connector => {
                        let head: RequestHead = decode_json(json)?;
                        if head.ws {
                            self.ws_mode.store(true, Ordering::Release);
                        }
                        Ok(TunnelFrame::ReqHead { id: 0, head })
                    }
                },
            },
            WireMessage::Binary(bytes) => {
                if self.ws_mode() {
                    Ok(TunnelFrame::WsFrame {
                        id: 0,
                        frame: decode_ws_payload(&bytes)?,
                    })
                } else {
                    Ok(match self.side {
                        CodecSide::Router => TunnelFrame::RspBody { id: 0, chunk: bytes },
                        CodecSide::Connector => TunnelFrame::ReqBody { id: 0, chunk: bytes },
                    })
                }
            }
        }
    }
}

/// `tunnel-v2`: multiplexed exchanges.
///
/// Every frame is Binary: `type(1) + exchange id(4 BE) + payload`. Frame
/// types are symmetric so the decoder is side-independent.
struct MultiplexedCodec;

impl TunnelCodec for MultiplexedCodec {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V2
    }

    fn encode(&self, frame: &TunnelFrame) -> Result<WireMessage, TunnelError> {
        let (frame_type, id, payload) = match frame {
            TunnelFrame::ReqHead { id, head } => {
                (FrameType::ReqHead, *id, encode_json(head)?.into_bytes())
            }
            TunnelFrame::ReqBody { id, chunk } => (FrameType::ReqBody, *id, chunk.clone()),
            TunnelFrame::ReqEnd { id } => (FrameType::ReqEnd, *id, Vec::new()),
            TunnelFrame::RspHead { id, head } => {
                (FrameType::RspHead, *id, encode_json(head)?.into_bytes())
            }
            TunnelFrame::RspBody { id, chunk } => (FrameType::RspBody, *id, chunk.clone()),
            TunnelFrame::RspEnd { id } => (FrameType::RspEnd, *id, Vec::new()),
            TunnelFrame::Cancel { id } => (FrameType::Cancel, *id, Vec::new()),
            TunnelFrame::WindowUpdate { id, credit } => {
                (FrameType::WindowUpdate, *id, credit.to_be_bytes().to_vec())
            }
            TunnelFrame::WsFrame { id, frame } => {
                (FrameType::WsFrame, *id, encode_ws_payload(frame))
            }
        };

        let mut buf = Vec::with_capacity(V2_HEADER_SIZE + payload.len());
        buf.push(frame_type.as_u8());
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(WireMessage::Binary(buf))
    }

    fn decode(&self, msg: WireMessage) -> Result<TunnelFrame, TunnelError> {
        let bytes = match msg {
            WireMessage::Binary(b) => b,
            WireMessage::Text(_) => {
                return Err(TunnelError::Protocol(
                    "unexpected text frame on multiplexed socket".into(),
                ))
            }
        };
        if bytes.len() < V2_HEADER_SIZE {
            return Err(TunnelError::Protocol(format!(
                "frame shorter than header: {} bytes",
                bytes.len()
            )));
        }
        let frame_type = FrameType::from_u8(bytes[0])
            .ok_or_else(|| TunnelError::Protocol(format!("unknown frame type 0x{:02x}", bytes[0])))?;
        let id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let payload = &bytes[V2_HEADER_SIZE..];

        Ok(match frame_type {
            FrameType::ReqHead => TunnelFrame::ReqHead {
                id,
                head: decode_json(std::str::from_utf8(payload).map_err(bad_utf8)?)?,
            },
            FrameType::ReqBody => TunnelFrame::ReqBody {
                id,
                chunk: payload.to_vec(),
            },
            FrameType::ReqEnd => TunnelFrame::ReqEnd { id },
            FrameType::RspHead => TunnelFrame::RspHead {
                id,
                head: decode_json(std::str::from_utf8(payload).map_err(bad_utf8)?)?,
            },
            FrameType::RspBody => TunnelFrame::RspBody {
                id,
                chunk: payload.to_vec(),
            },
            FrameType::RspEnd => TunnelFrame::RspEnd { id },
            FrameType::Cancel => TunnelFrame::Cancel { id },
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(TunnelError::Protocol("malformed window update".into()));
                }
                TunnelFrame::WindowUpdate {
                    id,
                    credit: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                }
            }
            FrameType::WsFrame => TunnelFrame::WsFrame {
                id,
                frame: decode_ws_payload(payload)?,
            },
        })
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, TunnelError> {
    serde_json::to_string(value).map_err(|e| TunnelError::Protocol(format!("encode head: {e}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(json: &str) -> Result<T, TunnelError> {
    serde_json::from_str(json).map_err(|e| TunnelError::Protocol(format!("decode head: {e}")))
}

fn bad_utf8(e: std::str::Utf8Error) -> TunnelError {
    TunnelError::Protocol(format!("head is not valid utf-8: {e}"))
}

fn encode_ws_payload(frame: &WsFrame) -> Vec<u8> {
    let mut buf = vec![frame.opcode()];
    match frame {
        WsFrame::Text(s) => buf.extend_from_slice(s.as_bytes()),
        WsFrame::Binary(b) | WsFrame::Ping(b) | WsFrame::Pong(b) => buf.extend_from_slice(b),
        WsFrame::Close => {}
    }
    buf
}

fn decode_ws_payload(payload: &[u8]) -> Result<WsFrame, TunnelError> {
    let (opcode, data) = payload
        .split_first()
        .ok_or_else(|| TunnelError::Protocol("empty ws pass-through frame".into()))?;
    Ok(match opcode {
        1 => WsFrame::Text(
            String::from_utf8(data.to_vec())
                .map_err(|e| TunnelError::Protocol(format!("ws text frame: {e}")))?,
        ),
        2 => WsFrame::Binary(data.to_vec()),
        8 => WsFrame::Close,
        9 => WsFrame::Ping(data.to_vec()),
        10 => WsFrame::Pong(data.to_vec()),
        other => {
            return Err(TunnelError::Protocol(format!(
                "unknown ws pass-through opcode {other}"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_head() -> RequestHead {
        RequestHead {
            method: "POST".into(),
            target: "/example/upload?v=1".into(),
            headers: vec![("content-type".into(), "text/plain".into())],
            body: true,
            ws: false,
        }
    }

    #[test]
    fn multiplexed_frames_carry_their_exchange_id() {
        let codec = MultiplexedCodec;
        let frame = TunnelFrame::ReqHead {
            id: 7,
            head: sample_head(),
        };
        let wire = codec.encode(&frame).unwrap();
        let decoded = codec.decode(wire).unwrap();
        match decoded {
            TunnelFrame::ReqHead { id, head } => {
                assert_eq!(id, 7);
                assert_eq!(head.method, "POST");
                assert_eq!(head.target, "/example/upload?v=1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn multiplexed_window_update_round_trips_credit() {
        let codec = MultiplexedCodec;
        let wire = codec
            .encode(&TunnelFrame::WindowUpdate { id: 3, credit: 65536 })
            .unwrap();
        match codec.decode(wire).unwrap() {
            TunnelFrame::WindowUpdate { id: 3, credit } => assert_eq!(credit, 65536),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn multiplexed_rejects_text_frames() {
        let codec = MultiplexedCodec;
        assert!(codec.decode(WireMessage::Text("END".into())).is_err());
    }

    #[test]
    fn single_exchange_decodes_by_side() {
        let router = SingleExchangeCodec::new(CodecSide::Router);
        let connector = SingleExchangeCodec::new(CodecSide::Connector);

        let wire = router
            .encode(&TunnelFrame::ReqHead {
                id: 0,
                head: sample_head(),
            })
            .unwrap();
        assert!(matches!(
            connector.decode(wire).unwrap(),
            TunnelFrame::ReqHead { id: 0, .. }
        ));

        // An END marker means "request complete" to the connector and
        // "response complete" to the router.
        assert!(matches!(
            connector.decode(WireMessage::Text("END".into())).unwrap(),
            TunnelFrame::ReqEnd { id: 0 }
        ));
        assert!(matches!(
            router.decode(WireMessage::Text("END".into())).unwrap(),
            TunnelFrame::RspEnd { id: 0 }
        ));
    }

    #[test]
    fn single_exchange_switches_to_ws_mode_after_upgrade_head() {
        let connector = SingleExchangeCodec::new(CodecSide::Connector);
        let mut head = sample_head();
        head.ws = true;
        head.body = false;

        let json = serde_json::to_string(&head).unwrap();
        connector.decode(WireMessage::Text(json)).unwrap();

        let frame = connector
            .decode(WireMessage::Binary(vec![1, b'h', b'i']))
            .unwrap();
        assert!(matches!(
            frame,
            TunnelFrame::WsFrame {
                id: 0,
                frame: WsFrame::Text(ref s)
            } if s == "hi"
        ));
    }

    #[test]
    fn single_exchange_has_no_window_updates() {
        let codec = SingleExchangeCodec::new(CodecSide::Router);
        assert!(codec
            .encode(&TunnelFrame::WindowUpdate { id: 0, credit: 1 })
            .is_err());
    }
}
