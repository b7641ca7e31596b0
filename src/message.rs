//! Chat message data model
//!
//! Defines the immutable `Message`, the `Identity` of its author, and the
//! `Broadcast` envelope that carries a message and its room name across the
//! durable bus as JSON.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Author identity attached to a message.
///
/// Resolved by the caller's authentication layer; the chat core only stores
/// and forwards it. System messages carry no identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    /// Stable author identifier
    pub id: String,
    /// Display name
    pub name: String,
}

/// A single chat message.
///
/// Producers construct one with [`Message::new`]; the identifier is
/// assigned and zero timestamps are stamped at ingestion, after which the
/// message is immutable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    /// Unique message identifier, assigned at ingestion
    pub id: String,
    /// Message author; `None` marks a system message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<Identity>,
    /// Message text, never empty once accepted
    pub content: String,
    /// Creation time in unix seconds
    pub created_at: i64,
    /// Last update time in unix seconds
    pub updated_at: i64,
}

impl Message {
    /// Create a message ready for ingestion. The identifier and timestamps
    /// are filled in when the message is broadcast or sent.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Attach an author identity.
    pub fn with_author(mut self, author: Identity) -> Self {
        self.author = Some(author);
        self
    }
}

/// Wire envelope carrying a message and its target room across the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Broadcast {
    /// Target room name
    #[serde(default)]
    pub room_name: String,
    /// The message itself, flattened into the envelope
    #[serde(flatten)]
    pub message: Message,
}

impl Broadcast {
    /// Envelope a message for the named room.
    pub fn new(room_name: impl Into<String>, message: Message) -> Self {
        Self {
            room_name: room_name.into(),
            message,
        }
    }
}

/// Current unix time in seconds.
pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let broadcast = Broadcast::new(
            "lobby",
            Message {
                id: "m-1".to_string(),
                author: Some(Identity {
                    id: "u-1".to_string(),
                    name: "Alice".to_string(),
                }),
                content: "hello".to_string(),
                created_at: 1700000000,
                updated_at: 1700000000,
            },
        );
        let json = serde_json::to_string(&broadcast).unwrap();
        assert!(json.contains("\"roomName\":\"lobby\""));
        assert!(json.contains("\"id\":\"m-1\""));
        assert!(json.contains("\"author\":{\"id\":\"u-1\",\"name\":\"Alice\"}"));
        assert!(json.contains("\"createdAt\":1700000000"));
        assert!(json.contains("\"updatedAt\":1700000000"));
    }

    #[test]
    fn test_system_message_omits_author() {
        let broadcast = Broadcast::new("lobby", Message::new("maintenance at noon"));
        let json = serde_json::to_string(&broadcast).unwrap();
        assert!(!json.contains("author"));
    }

    #[test]
    fn test_lenient_decoding_fills_defaults() {
        let broadcast: Broadcast =
            serde_json::from_str(r#"{"roomName":"lobby","content":"hi"}"#).unwrap();
        assert_eq!(broadcast.room_name, "lobby");
        assert_eq!(broadcast.message.content, "hi");
        assert_eq!(broadcast.message.id, "");
        assert!(broadcast.message.author.is_none());
        assert_eq!(broadcast.message.created_at, 0);
    }

    #[test]
    fn test_envelope_round_trip() {
        let original = Broadcast::new(
            "news",
            Message {
                id: "m-2".to_string(),
                author: None,
                content: "round trip".to_string(),
                created_at: 42,
                updated_at: 43,
            },
        );
        let json = serde_json::to_vec(&original).unwrap();
        let decoded: Broadcast = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_unix_timestamp_is_positive() {
        assert!(unix_timestamp() > 0);
    }
}
