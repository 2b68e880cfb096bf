//! Wire envelopes.
//!
//! Both planes use the same JSON shape:
//! ```text
//! { "type": "portal.v1.<direction>.<name>", "payload": { ... } }
//! ```
//!
//! Control-plane messages travel as plain WebSocket text frames to and from
//! the rendezvous server. Data-plane messages are serialized the same way and
//! then sealed by [`CryptoChannel`](crate::crypt::CryptoChannel); a receiver
//! decrypts before any structural parsing. Unknown types fail to parse. No
//! fallback. No default.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Data-plane protocol version announced in the receiver handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Byte fields travel as standard base64 strings.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Control-plane message exchanged with the rendezvous server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RendezvousMessage {
    /// Sender asks the server for a free channel id.
    #[serde(rename = "portal.v1.sender.bind")]
    SenderBind {},
    /// Channel id reserved for the sender. Its password starts with it.
    #[serde(rename = "portal.v1.rendezvous.bound")]
    Bound {
        /// Reserved channel id.
        channel: u32,
    },
    /// Sender registers under a password hash.
    #[serde(rename = "portal.v1.sender.establish")]
    SenderEstablish {
        /// Hex SHA-256 of the password channel id.
        password_hash: String,
    },
    /// Receiver asks to be paired with the sender holding the same hash.
    #[serde(rename = "portal.v1.receiver.establish")]
    ReceiverEstablish {
        /// Hex SHA-256 of the password channel id.
        password_hash: String,
    },
    /// Server tells the sender a receiver joined.
    #[serde(rename = "portal.v1.rendezvous.approve")]
    Approve {},
    /// Sender's PAKE bytes, relayed verbatim to the receiver.
    #[serde(rename = "portal.v1.sender.pake")]
    SenderPake {
        /// Opaque exchange bytes.
        #[serde(with = "b64")]
        bytes: Vec<u8>,
    },
    /// Receiver's PAKE bytes, relayed verbatim to the sender.
    #[serde(rename = "portal.v1.receiver.pake")]
    ReceiverPake {
        /// Opaque exchange bytes.
        #[serde(with = "b64")]
        bytes: Vec<u8>,
    },
    /// Server-issued session salt, sent to both peers.
    #[serde(rename = "portal.v1.rendezvous.salt")]
    Salt {
        /// Random salt bytes.
        #[serde(with = "b64")]
        salt: Vec<u8>,
    },
    /// Sealed [`ConnectionInfo`] from the sender.
    #[serde(rename = "portal.v1.sender.info")]
    SenderInfo {
        /// Sealed frame.
        #[serde(with = "b64")]
        sealed: Vec<u8>,
    },
    /// Sealed [`ConnectionInfo`] from the receiver.
    #[serde(rename = "portal.v1.receiver.info")]
    ReceiverInfo {
        /// Sealed frame.
        #[serde(with = "b64")]
        sealed: Vec<u8>,
    },
    /// Receiver could not reach the sender directly.
    #[serde(rename = "portal.v1.receiver.relay-request")]
    RelayRequest {},
    /// Server switched this connection to relay mode.
    #[serde(rename = "portal.v1.rendezvous.relay-ready")]
    RelayReady {},
    /// The other peer disconnected.
    #[serde(rename = "portal.v1.rendezvous.peer-gone")]
    PeerGone {},
    /// Server-side rejection.
    #[serde(rename = "portal.v1.rendezvous.error")]
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl RendezvousMessage {
    /// Stable type identifier, as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SenderBind {} => "portal.v1.sender.bind",
            Self::Bound { .. } => "portal.v1.rendezvous.bound",
            Self::SenderEstablish { .. } => "portal.v1.sender.establish",
            Self::ReceiverEstablish { .. } => "portal.v1.receiver.establish",
            Self::Approve {} => "portal.v1.rendezvous.approve",
            Self::SenderPake { .. } => "portal.v1.sender.pake",
            Self::ReceiverPake { .. } => "portal.v1.receiver.pake",
            Self::Salt { .. } => "portal.v1.rendezvous.salt",
            Self::SenderInfo { .. } => "portal.v1.sender.info",
            Self::ReceiverInfo { .. } => "portal.v1.receiver.info",
            Self::RelayRequest {} => "portal.v1.receiver.relay-request",
            Self::RelayReady {} => "portal.v1.rendezvous.relay-ready",
            Self::PeerGone {} => "portal.v1.rendezvous.peer-gone",
            Self::Error { .. } => "portal.v1.rendezvous.error",
        }
    }

    /// Serialize to JSON text.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse JSON text.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Data-plane message. Always sealed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransferMessage {
    /// Receiver opens the transfer.
    #[serde(rename = "portal.v1.receiver.handshake")]
    ReceiverHandshake {
        /// Receiver's protocol version.
        version: u32,
    },
    /// Sender announces the payload.
    #[serde(rename = "portal.v1.sender.handshake")]
    SenderHandshake {
        /// Display name of the payload.
        name: String,
        /// Total payload length in bytes.
        size: u64,
    },
    /// Receiver asks for the payload.
    #[serde(rename = "portal.v1.receiver.request-payload")]
    RequestPayload {},
    /// One slice of the payload. Boundaries carry no meaning.
    #[serde(rename = "portal.v1.sender.payload-chunk")]
    PayloadChunk {
        /// Chunk bytes.
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    /// No more chunks follow.
    #[serde(rename = "portal.v1.sender.payload-end")]
    PayloadEnd {},
    /// Receiver got everything and closes.
    #[serde(rename = "portal.v1.receiver.closing")]
    ReceiverClosing {},
    /// Sender confirms the close.
    #[serde(rename = "portal.v1.sender.closing")]
    SenderClosing {},
}

impl TransferMessage {
    /// Stable type identifier, as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReceiverHandshake { .. } => "portal.v1.receiver.handshake",
            Self::SenderHandshake { .. } => "portal.v1.sender.handshake",
            Self::RequestPayload {} => "portal.v1.receiver.request-payload",
            Self::PayloadChunk { .. } => "portal.v1.sender.payload-chunk",
            Self::PayloadEnd {} => "portal.v1.sender.payload-end",
            Self::ReceiverClosing {} => "portal.v1.receiver.closing",
            Self::SenderClosing {} => "portal.v1.sender.closing",
        }
    }

    /// Serialize to JSON bytes (before sealing).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse JSON bytes (after opening).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Direct-connection metadata, exchanged sealed over the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Address the peer accepts direct connections on, if any.
    pub addr: Option<SocketAddr>,
}

impl ConnectionInfo {
    /// Serialize to JSON bytes (before sealing).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse JSON bytes (after opening).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let msg = RendezvousMessage::SenderPake { bytes: vec![1, 2, 3] };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "portal.v1.sender.pake");
        assert_eq!(value["payload"]["bytes"], "AQID");
    }

    #[test]
    fn test_empty_payload_is_object() {
        let json = RendezvousMessage::Approve {}.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["payload"].is_object());
        assert_eq!(RendezvousMessage::from_json(&json).unwrap(), RendezvousMessage::Approve {});
    }

    #[test]
    fn test_kind_matches_wire_type() {
        let messages = vec![
            RendezvousMessage::SenderBind {},
            RendezvousMessage::Bound { channel: 42 },
            RendezvousMessage::SenderEstablish { password_hash: "ab".into() },
            RendezvousMessage::Salt { salt: vec![0; 4] },
            RendezvousMessage::RelayReady {},
            RendezvousMessage::Error { message: "nope".into() },
        ];
        for msg in messages {
            let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
            assert_eq!(value["type"], msg.kind());
        }

        let chunk = TransferMessage::PayloadChunk { data: vec![9; 3] };
        let value: serde_json::Value = serde_json::from_slice(&chunk.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], chunk.kind());
    }

    #[test]
    fn test_bound_carries_channel() {
        let json = RendezvousMessage::Bound { channel: 731 }.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["payload"]["channel"], 731);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let text = r#"{"type":"portal.v2.sender.pake","payload":{"bytes":""}}"#;
        assert!(matches!(
            RendezvousMessage::from_json(text),
            Err(ProtocolError::Malformed(_))
        ));
        let bytes = br#"{"type":"portal.v1.sender.teleport","payload":{}}"#;
        assert!(matches!(
            TransferMessage::from_bytes(bytes),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let text = r#"{"type":"portal.v1.rendezvous.salt","payload":{"salt":"!!!"}}"#;
        assert!(RendezvousMessage::from_json(text).is_err());
    }

    #[test]
    fn test_connection_info_roundtrip() {
        let info = ConnectionInfo { addr: Some("192.168.1.20:40123".parse().unwrap()) };
        assert_eq!(ConnectionInfo::from_bytes(&info.to_bytes().unwrap()).unwrap(), info);
        let none = ConnectionInfo { addr: None };
        assert_eq!(ConnectionInfo::from_bytes(&none.to_bytes().unwrap()).unwrap(), none);
    }
}
