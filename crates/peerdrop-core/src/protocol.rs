//! Relay wire envelopes
//!
//! All relay traffic is JSON text frames. Envelopes are tagged with a
//! `type` field; negotiation payloads travel inside `signal` envelopes as
//! opaque JSON values that the relay never parses. That opacity is what
//! lets the peer-to-peer protocol evolve without relay changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry in the presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Display name, possibly a generated `Device-NNNN` placeholder
    pub name: String,
    /// Registration timestamp, unix millis
    pub since: u64,
}

/// Announcement that a file is being offered to a room.
///
/// Carries metadata only, never file bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAnnouncement {
    pub room: String,
    pub name: String,
    pub size: u64,
    pub sender: String,
    pub sender_id: String,
}

/// Envelopes an endpoint sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Set or update the display name. Empty name gets a generated one.
    Register {
        #[serde(default)]
        name: String,
    },
    /// Join a room, creating it if absent.
    Join { room: String },
    /// Explicit room exit.
    Leave,
    /// Request a presence snapshot.
    Who,
    /// Forward an opaque negotiation payload. If `to` is set, unicast;
    /// otherwise, if `room` is set, deliver to the room excluding the sender.
    Signal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        data: serde_json::Value,
    },
    /// Announce a file offer to a room.
    FileShared(FileAnnouncement),
}

/// Envelopes the relay sends to an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on every connection: the connection id the relay assigned.
    Welcome { id: String },
    /// Presence snapshot of all registered endpoints.
    Devices {
        devices: BTreeMap<String, DeviceInfo>,
    },
    /// Updated member count for a room the recipient belongs to.
    RoomMembers { room: String, count: usize },
    /// Another endpoint joined a room the recipient belongs to.
    PeerJoined { peer: String },
    /// A room member disconnected or left.
    PeerLeft { peer: String },
    /// A forwarded negotiation payload.
    Signal {
        from: String,
        data: serde_json::Value,
    },
    /// A forwarded file announcement.
    FileShared(FileAnnouncement),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_tags() {
        let msg = ClientMessage::Register {
            name: "kitchen-laptop".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"register","name":"kitchen-laptop"}"#);

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"who"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Who);

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"join","room":"12345"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Join { room: "12345".into() });
    }

    #[test]
    fn test_signal_unicast_roundtrip() {
        let msg = ClientMessage::Signal {
            room: None,
            to: Some("abc".into()),
            data: serde_json::json!({"kind": "offer", "description": "sdp"}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        // `room` is omitted entirely when unset
        assert!(!json.contains("room"));
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_file_shared_field_names() {
        let msg = ClientMessage::FileShared(FileAnnouncement {
            room: "12345".into(),
            name: "x.bin".into(),
            size: 700_000,
            sender: "A".into(),
            sender_id: "conn-1".into(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"file-shared""#));
        assert!(json.contains(r#""senderId":"conn-1""#));
    }

    #[test]
    fn test_server_message_roundtrip() {
        let mut devices = BTreeMap::new();
        devices.insert(
            "conn-1".to_string(),
            DeviceInfo {
                name: "Device-1234".into(),
                since: 1_700_000_000_000,
            },
        );
        let msg = ServerMessage::Devices { devices };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);

        let msg = ServerMessage::RoomMembers {
            room: "12345".into(),
            count: 2,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"room-members""#));
    }

    #[test]
    fn test_malformed_envelope_is_an_error_not_a_panic() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"warp"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }
}
