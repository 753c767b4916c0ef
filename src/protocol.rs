//! JSON wire protocol shared by the room coordinator and its clients.
//!
//! Every frame is one JSON object tagged by a `"type"` field:
//!
//! | tag      | payload                          | persisted |
//! |----------|----------------------------------|-----------|
//! | `add`    | full [`ChatMessage`] fields      | yes       |
//! | `update` | full [`ChatMessage`] fields      | yes (overwrite) |
//! | `all`    | ordered list of [`ChatMessage`]  | no — server→client snapshot |
//! | `typing` | `user`, `isTyping`               | no        |
//! | `read`   | `user`, `lastRead`               | no        |
//!
//! Tags outside this table are passed through the coordinator verbatim, so
//! newer clients can ship new signal kinds without a server upgrade.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Tags the coordinator knows how to interpret.
///
/// A frame whose `"type"` is listed here but whose body fails to decode is
/// malformed and gets dropped; anything else is forwarded untouched.
pub const KNOWN_TAGS: &[&str] = &["add", "update", "all", "typing", "read"];

/// Wall-clock milliseconds since the Unix epoch.
///
/// Message timestamps are client-assigned and unsynchronized across
/// clients; this is the server-side default for messages that arrive
/// without one.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Who authored a message. Display-only — nothing is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parse a stored label. Returns `None` for anything unrecognized so
    /// the caller can pick its own fallback.
    pub fn from_label(label: &str) -> Option<Role> {
        match label {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A single chat message — the durable entity of the room.
///
/// `reply_to` embeds a full copy of the quoted message taken at
/// reply-creation time. Quotes are frozen: editing the original later does
/// not rewrite copies embedded elsewhere. Quotes may nest to any depth and
/// are stored and transmitted at full depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Client-generated, assumed collision-free within a room.
    pub id: String,
    pub content: String,
    /// Display name. Not unique, not authenticated.
    pub user: String,
    pub role: Role,
    #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Box<ChatMessage>>,
    /// Wall-clock milliseconds at creation. 0 means "not set" and is
    /// stamped server-side on arrival.
    #[serde(default)]
    pub timestamp: i64,
}

impl ChatMessage {
    /// Create a fresh message with a generated id and current timestamp.
    pub fn new(user: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            user: user.into(),
            role,
            reply_to: None,
            timestamp: now_ms(),
        }
    }

    /// Create a reply quoting `quoted` as it exists right now.
    pub fn reply(
        user: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        quoted: &ChatMessage,
    ) -> Self {
        let mut msg = Self::new(user, role, content);
        msg.reply_to = Some(Box::new(quoted.clone()));
        msg
    }

    /// Depth of the quote chain hanging off this message (0 = no quote).
    pub fn quote_depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.reply_to.as_deref();
        while let Some(quoted) = cursor {
            depth += 1;
            cursor = quoted.reply_to.as_deref();
        }
        depth
    }
}

/// Top-level protocol envelope.
///
/// Serialized as one JSON object per frame, discriminated by `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// A new message. Field names land inline next to the tag.
    Add(ChatMessage),
    /// A rewrite of an existing message (same id).
    Update(ChatMessage),
    /// Join-time history snapshot. Synthetic, server→client only.
    All { messages: Vec<ChatMessage> },
    /// Ephemeral typing indicator.
    Typing {
        user: String,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    /// Ephemeral read receipt.
    Read {
        user: String,
        #[serde(rename = "lastRead")]
        last_read: i64,
    },
}

impl Envelope {
    pub fn add(message: ChatMessage) -> Self {
        Envelope::Add(message)
    }

    pub fn update(message: ChatMessage) -> Self {
        Envelope::Update(message)
    }

    pub fn all(messages: Vec<ChatMessage>) -> Self {
        Envelope::All { messages }
    }

    pub fn typing(user: impl Into<String>, is_typing: bool) -> Self {
        Envelope::Typing {
            user: user.into(),
            is_typing,
        }
    }

    pub fn read(user: impl Into<String>, last_read: i64) -> Self {
        Envelope::Read {
            user: user.into(),
            last_read,
        }
    }

    /// The wire tag of this envelope.
    pub fn tag(&self) -> &'static str {
        match self {
            Envelope::Add(_) => "add",
            Envelope::Update(_) => "update",
            Envelope::All { .. } => "all",
            Envelope::Typing { .. } => "typing",
            Envelope::Read { .. } => "read",
        }
    }

    /// Whether this envelope carries state that outlives the broadcast.
    /// `typing`/`read` are fire-and-forget; `all` is synthesized from the
    /// ledger and never written back.
    pub fn is_durable(&self) -> bool {
        matches!(self, Envelope::Add(_) | Envelope::Update(_))
    }

    /// The message payload of a durable envelope.
    pub fn chat_message(&self) -> Option<&ChatMessage> {
        match self {
            Envelope::Add(msg) | Envelope::Update(msg) => Some(msg),
            _ => None,
        }
    }

    /// Serialize to a JSON wire frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a JSON wire frame.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(id: &str, ts: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            content: format!("message {id}"),
            user: "alice".to_string(),
            role: Role::User,
            reply_to: None,
            timestamp: ts,
        }
    }

    #[test]
    fn test_add_wire_shape() {
        let env = Envelope::add(sample("m1", 1000));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "add",
                "id": "m1",
                "content": "message m1",
                "user": "alice",
                "role": "user",
                "timestamp": 1000,
            })
        );
    }

    #[test]
    fn test_typing_wire_shape() {
        let env = Envelope::typing("bob", true);
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value, json!({"type": "typing", "user": "bob", "isTyping": true}));
    }

    #[test]
    fn test_read_wire_shape() {
        let env = Envelope::read("bob", 1234);
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value, json!({"type": "read", "user": "bob", "lastRead": 1234}));
    }

    #[test]
    fn test_envelope_roundtrip_all_variants() {
        let msgs = vec![sample("a", 1), sample("b", 2)];
        let envelopes = vec![
            Envelope::add(sample("m1", 10)),
            Envelope::update(sample("m1", 20)),
            Envelope::all(msgs),
            Envelope::typing("alice", false),
            Envelope::read("alice", 99),
        ];

        for env in envelopes {
            let encoded = env.encode().unwrap();
            let decoded = Envelope::decode(&encoded).unwrap();
            assert_eq!(env, decoded);
        }
    }

    #[test]
    fn test_reply_nesting_roundtrip() {
        let root = sample("root", 1);
        let first = ChatMessage::reply("bob", Role::User, "first reply", &root);
        let second = ChatMessage::reply("carol", Role::Assistant, "second reply", &first);

        assert_eq!(second.quote_depth(), 2);

        let encoded = Envelope::add(second.clone()).encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        let msg = decoded.chat_message().unwrap();
        assert_eq!(msg.quote_depth(), 2);
        assert_eq!(
            msg.reply_to.as_ref().unwrap().reply_to.as_ref().unwrap().id,
            "root"
        );
    }

    #[test]
    fn test_quote_is_frozen() {
        let mut original = sample("orig", 5);
        let reply = ChatMessage::reply("bob", Role::User, "quoting you", &original);

        original.content = "edited afterwards".to_string();

        assert_eq!(reply.reply_to.as_ref().unwrap().content, "message orig");
    }

    #[test]
    fn test_missing_timestamp_defaults_to_zero() {
        let raw = r#"{"type":"add","id":"x","content":"hi","user":"alice","role":"user"}"#;
        let env = Envelope::decode(raw).unwrap();
        assert_eq!(env.chat_message().unwrap().timestamp, 0);
    }

    #[test]
    fn test_reply_to_absent_is_omitted() {
        let encoded = Envelope::add(sample("m1", 1)).encode().unwrap();
        assert!(!encoded.contains("replyTo"));
    }

    #[test]
    fn test_unknown_tag_fails_decode() {
        let raw = r#"{"type":"reaction","user":"bob","emoji":"wave"}"#;
        assert!(Envelope::decode(raw).is_err());
    }

    #[test]
    fn test_garbage_fails_decode() {
        assert!(Envelope::decode("{not json").is_err());
        assert!(Envelope::decode("").is_err());
    }

    #[test]
    fn test_known_tag_with_bad_body_fails_decode() {
        // "add" without the required fields is malformed, not unknown.
        assert!(Envelope::decode(r#"{"type":"add"}"#).is_err());
    }

    #[test]
    fn test_role_labels() {
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
        assert_eq!(Role::from_label("assistant"), Some(Role::Assistant));
        assert_eq!(Role::from_label("moderator"), None);
    }

    #[test]
    fn test_durability_split() {
        assert!(Envelope::add(sample("a", 1)).is_durable());
        assert!(Envelope::update(sample("a", 2)).is_durable());
        assert!(!Envelope::all(vec![]).is_durable());
        assert!(!Envelope::typing("a", true).is_durable());
        assert!(!Envelope::read("a", 1).is_durable());
    }

    #[test]
    fn test_new_message_gets_id_and_timestamp() {
        let msg = ChatMessage::new("alice", Role::User, "hello");
        assert!(!msg.id.is_empty());
        assert!(msg.timestamp > 0);
        assert_eq!(msg.quote_depth(), 0);
    }

    #[test]
    fn test_tags_match_known_set() {
        let envelopes = vec![
            Envelope::add(sample("a", 1)),
            Envelope::update(sample("a", 1)),
            Envelope::all(vec![]),
            Envelope::typing("a", true),
            Envelope::read("a", 1),
        ];
        for env in envelopes {
            assert!(KNOWN_TAGS.contains(&env.tag()));
        }
    }
}
