//! Waiting-room messages, exchanged as JSON text frames before a tunnel's
//! peer sockets exist.

use serde::{Deserialize, Serialize};

/// A waiting-room frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
#[non_exhaustive]
pub enum SessionMessage {
    /// Either direction: keeps the socket open. The relay echoes it.
    Keepalive,
    /// Relay → client: the other peer is present.
    PeerConnected,
    /// Relay → client: the other peer left.
    PeerDisconnected,
    /// Client → relay: create a tunnel for me.
    TunnelCreate,
    /// Relay → client: the tunnel exists and can be joined with `secret`.
    TunnelCreated {
        /// Id of the new tunnel.
        tunnel_id: String,
        /// One-time pairing secret for the joiner.
        secret: String,
        /// Capability token for the creator.
        token: String,
    },
    /// Client → relay: the uploader has picked a file.
    TunnelUploaderReady {
        /// Tunnel the file will be offered on.
        tunnel_id: String,
        /// File name.
        name: String,
        /// File size in bytes.
        size: u64,
        /// MIME type.
        mime_type: String,
    },
}

/// Serializes a waiting-room message to its text frame.
pub fn encode_session(msg: &SessionMessage) -> serde_json::Result<String> {
    serde_json::to_string(msg)
}

/// Parses a waiting-room text frame.
pub fn decode_session(text: &str) -> serde_json::Result<SessionMessage> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_session_messages() {
        let cases = vec![
            SessionMessage::Keepalive,
            SessionMessage::PeerConnected,
            SessionMessage::PeerDisconnected,
            SessionMessage::TunnelCreate,
            SessionMessage::TunnelCreated {
                tunnel_id: "abc".into(),
                secret: "Q7ZK2M".into(),
                token: "1|abc|127.0.0.1|sig".into(),
            },
            SessionMessage::TunnelUploaderReady {
                tunnel_id: "abc".into(),
                name: "a.txt".into(),
                size: 9,
                mime_type: "text/plain".into(),
            },
        ];
        for msg in cases {
            let text = encode_session(&msg).unwrap();
            assert_eq!(decode_session(&text).unwrap(), msg);
        }
    }

    #[test]
    fn wire_shape_is_tagged_camel_case() {
        let text = encode_session(&SessionMessage::TunnelCreated {
            tunnel_id: "t".into(),
            secret: "s".into(),
            token: "k".into(),
        })
        .unwrap();
        assert_eq!(
            text,
            r#"{"type":"TunnelCreated","tunnelId":"t","secret":"s","token":"k"}"#
        );
        assert_eq!(
            decode_session(r#"{"type":"Keepalive"}"#).unwrap(),
            SessionMessage::Keepalive
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_session("not json").is_err());
        assert!(decode_session(r#"{"type":"Nope"}"#).is_err());
    }
}
