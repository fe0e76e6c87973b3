use thiserror::Error;

use crate::types::LocalId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("credential rejected: {0}")]
    Auth(String),
    #[error("no room is focused")]
    NoFocusedRoom,
    #[error("unknown local message {0}")]
    UnknownLocalMessage(LocalId),
}

impl ChatError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
