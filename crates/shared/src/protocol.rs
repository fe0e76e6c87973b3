use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ClientToken, MessageId, ParticipantId, RoomId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

/// Message body. On the wire this flattens into the enclosing object as
/// `"type": "text" | "product"` next to `"content"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum MessageContent {
    Text(String),
    Product(ProductContext),
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// One-line rendering used for thread summaries and search.
    pub fn preview(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Product(product) => &product.title,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(flatten)]
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<ClientToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub id: RoomId,
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_context: Option<ProductContext>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadRecord {
    /// The participant on the other side of the conversation from `me`.
    pub fn counterpart(&self, me: &ParticipantId) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|participant| &participant.id != me)
            .or_else(|| self.participants.first())
    }
}

/// Body of a message send, used both as the `send-message` envelope payload
/// and as the REST send request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub room_id: RoomId,
    pub client_token: ClientToken,
    #[serde(flatten)]
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateThreadRequest {
    pub participant_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_context: Option<ProductContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    Join { room_id: RoomId },
    Leave { room_id: RoomId },
    SendMessage(OutgoingMessage),
    Typing { room_id: RoomId },
    StopTyping { room_id: RoomId },
    MarkRead { room_id: RoomId },
}

impl ClientRequest {
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Join { room_id }
            | Self::Leave { room_id }
            | Self::Typing { room_id }
            | Self::StopTyping { room_id }
            | Self::MarkRead { room_id } => room_id,
            Self::SendMessage(message) => &message.room_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    MessageReceived {
        room_id: RoomId,
        message: MessageRecord,
    },
    TypingStarted {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    TypingStopped {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    ThreadUpdated {
        thread: ThreadRecord,
    },
    SendRejected {
        room_id: RoomId,
        client_token: ClientToken,
        error: ApiError,
    },
    Error(ApiError),
}
