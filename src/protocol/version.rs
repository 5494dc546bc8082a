//! Protocol version identifiers and handshake negotiation.

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// Wire protocol versions carried over the registration WebSocket.
///
/// `V1` runs one exchange per socket and closes the socket when the
/// exchange completes. `V2` multiplexes concurrent exchanges over one
/// socket with per-exchange ids and byte credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "tunnel-v1")]
    V1,
    #[serde(rename = "tunnel-v2")]
    V2,
}

impl ProtocolVersion {
    /// WebSocket subprotocol name used during the upgrade handshake.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "tunnel-v1",
            ProtocolVersion::V2 => "tunnel-v2",
        }
    }

    pub fn from_subprotocol(name: &str) -> Option<Self> {
        match name.trim() {
            "tunnel-v1" => Some(ProtocolVersion::V1),
            "tunnel-v2" => Some(ProtocolVersion::V2),
            _ => None,
        }
    }

    /// True if the version multiplexes exchanges over one socket.
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, ProtocolVersion::V2)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.subprotocol())
    }
}

/// Pick the version to run a socket on.
///
/// `supported` is the router's list, `offered` the connector's preference
/// order. The first offered version the router supports wins, so the
/// connector's ordering decides among mutually supported versions.
pub fn negotiate(
    supported: &[ProtocolVersion],
    offered: &[ProtocolVersion],
) -> Result<ProtocolVersion, TunnelError> {
    offered
        .iter()
        .copied()
        .find(|v| supported.contains(v))
        .ok_or_else(|| TunnelError::ProtocolVersionMismatch {
            offered: offered
                .iter()
                .map(|v| v.subprotocol())
                .collect::<Vec<_>>()
                .join(", "),
        })
}

/// Parse a `Sec-WebSocket-Protocol` header value into known versions,
/// preserving the client's preference order. Unknown names are skipped.
pub fn parse_offered(header: &str) -> Vec<ProtocolVersion> {
    header
        .split(',')
        .filter_map(ProtocolVersion::from_subprotocol)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_prefers_connector_order() {
        let supported = vec![ProtocolVersion::V1, ProtocolVersion::V2];
        let offered = vec![ProtocolVersion::V2, ProtocolVersion::V1];
        assert_eq!(negotiate(&supported, &offered).unwrap(), ProtocolVersion::V2);
    }

    #[test]
    fn negotiation_settles_on_older_version() {
        // A connector preferring v2 against a router that only runs v1.
        let supported = vec![ProtocolVersion::V1];
        let offered = vec![ProtocolVersion::V2, ProtocolVersion::V1];
        assert_eq!(negotiate(&supported, &offered).unwrap(), ProtocolVersion::V1);
    }

    #[test]
    fn negotiation_fails_with_no_common_version() {
        let supported = vec![ProtocolVersion::V2];
        let offered = vec![ProtocolVersion::V1];
        let err = negotiate(&supported, &offered).unwrap_err();
        assert!(matches!(
            err,
            crate::error::TunnelError::ProtocolVersionMismatch { .. }
        ));
    }

    #[test]
    fn offered_header_parsing_skips_unknown_names() {
        let offered = parse_offered("tunnel-v9, tunnel-v2 , tunnel-v1");
        assert_eq!(offered, vec![ProtocolVersion::V2, ProtocolVersion::V1]);
    }
}
