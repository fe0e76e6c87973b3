use std::fmt;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientToken, MessageId, ParticipantId},
    protocol::{MessageContent, MessageRecord, OutgoingMessage},
};

/// Session-scoped id of an optimistic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Pending(LocalId),
    Confirmed(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub key: MessageKey,
    pub client_token: Option<ClientToken>,
    pub sender_id: ParticipantId,
    pub sender_name: Option<String>,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
}

impl ChatMessage {
    pub fn confirmed(record: MessageRecord) -> Self {
        Self {
            key: MessageKey::Confirmed(record.id),
            client_token: record.client_token,
            sender_id: record.sender_id,
            sender_name: record.sender_name,
            content: record.content,
            created_at: record.created_at,
            delivery: DeliveryState::Confirmed,
        }
    }

    pub fn id(&self) -> Option<&MessageId> {
        match &self.key {
            MessageKey::Confirmed(id) => Some(id),
            MessageKey::Pending(_) => None,
        }
    }

    pub fn local_id(&self) -> Option<LocalId> {
        match self.key {
            MessageKey::Pending(local_id) => Some(local_id),
            MessageKey::Confirmed(_) => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.delivery == DeliveryState::Confirmed
    }
}

/// An optimistic send handed to the network layer.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundDraft {
    pub local_id: LocalId,
    pub message: OutgoingMessage,
}

/// Opaque session credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    pub credential: Credential,
    pub participant_id: ParticipantId,
}

impl SessionContext {
    pub fn new(credential: Credential, participant_id: ParticipantId) -> Self {
        Self {
            credential,
            participant_id,
        }
    }
}
