//! Wire model for the companion app's chat socket.
//!
//! The page's own WebSocket carries JSON frames shaped as
//! `{event_name, payload?}`. These types decode that traffic strictly at
//! the boundary; anything with an unrecognized content type lands in
//! `MessageContent::Unknown` instead of failing the frame.

use serde::{Deserialize, Serialize};

/// Who authored a chat message inside the companion app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageNature {
    /// The logged-in human user. Messages of this nature are echoes of
    /// our own sends and must not be relayed back.
    Customer,
    Operator,
    Robot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Images {
        #[serde(default)]
        text: String,
        #[serde(default)]
        images: Vec<String>,
    },
    ServiceMessage {
        #[serde(default)]
        text: String,
    },
    VoiceRecord {
        #[serde(default)]
        text: String,
    },
    VoiceRecognized {
        #[serde(default)]
        text: String,
    },
    Achievement {
        #[serde(default)]
        text: String,
        #[serde(default)]
        achievement_description: String,
    },
    /// Forward-compatibility catch-all for content kinds the page may add.
    #[serde(other)]
    Unknown,
}

impl MessageContent {
    /// Only plain text is actionable downstream; everything else is a no-op.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(default)]
    pub nature: Option<MessageNature>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub content: MessageContent,
    pub meta: MessageMeta,
}

impl ChatMessage {
    /// A bare text message with no metadata, as synthesized by the
    /// DOM-polling observer.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            id: None,
            content: MessageContent::Text { text: text.into() },
            meta: MessageMeta::default(),
        }
    }

    /// True when the message originated on the far side of the page
    /// (anything that is not an echo of the user's own input).
    pub fn is_incoming(&self) -> bool {
        self.meta.nature != Some(MessageNature::Customer)
    }
}

/// One frame of the page's chat socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketEvent {
    pub event_name: String,
    #[serde(default)]
    pub payload: Option<ChatMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_content_decode() {
        let json = r#"{"type": "text", "text": "hello there"}"#;
        let content: MessageContent = serde_json::from_str(json).unwrap();
        assert_eq!(content.as_text(), Some("hello there"));
    }

    #[test]
    fn test_unknown_content_decodes_to_catch_all() {
        let json = r#"{"type": "hologram", "text": "??"}"#;
        let content: MessageContent = serde_json::from_str(json).unwrap();
        assert!(matches!(content, MessageContent::Unknown));
        assert!(content.as_text().is_none());
    }

    #[test]
    fn test_robot_message_is_incoming() {
        let json = r#"{
            "id": "m1",
            "content": {"type": "text", "text": "hi"},
            "meta": {"nature": "Robot", "chat_id": "c1"}
        }"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert!(msg.is_incoming());
    }

    #[test]
    fn test_customer_echo_is_not_incoming() {
        let json = r#"{
            "content": {"type": "text", "text": "me"},
            "meta": {"nature": "Customer"}
        }"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert!(!msg.is_incoming());
    }

    #[test]
    fn test_socket_event_without_payload() {
        let json = r#"{"event_name": "start_typing"}"#;
        let ev: SocketEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.event_name, "start_typing");
        assert!(ev.payload.is_none());
    }

    #[test]
    fn test_missing_nature_counts_as_incoming() {
        let json = r#"{
            "content": {"type": "service_message", "text": "maintenance"},
            "meta": {}
        }"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert!(msg.is_incoming());
    }
}
