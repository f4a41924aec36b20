use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, MessageId, MessageKind, UserId};

/// The authoritative representation of a stored message as carried on the
/// wire and returned from the submit endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    pub sequence_number: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One unit of real-time delivery on a user's channel. Immutable once
/// created; the discriminant keeps each delivery path statically checkable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Envelope {
    ChatMessage {
        message: MessagePayload,
    },
    MessageAck {
        client_msg_id: String,
        server_msg_id: MessageId,
        chat_id: ChatId,
        sequence_number: i64,
    },
    ReadReceipt {
        chat_id: ChatId,
        message_id: MessageId,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    },
    Typing {
        chat_id: ChatId,
        user_id: UserId,
        typing: bool,
    },
}

impl Envelope {
    /// Typing indicators are transient; everything else is worth keeping
    /// for a disconnected recipient.
    pub fn survives_offline(&self) -> bool {
        !matches!(self, Envelope::Typing { .. })
    }
}

/// Logical channel name for a user's unified delivery stream.
pub fn user_channel(user_id: UserId) -> String {
    format!("user.{}.messages", user_id.0)
}
