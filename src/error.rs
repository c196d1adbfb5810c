//! Errors that reach the sender of a message.
//! Everything below the orchestrator degrades instead of failing; only input
//! validation and persistence surface here.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid message: {0}")]
    Validation(String),
    #[error("failed to persist message: {0}")]
    Persistence(#[from] StoreError),
}

impl SendError {
    pub fn status_code(&self) -> u16 {
        match self {
            SendError::Validation(_) => 400,
            SendError::Persistence(StoreError::ConversationNotFound(_)) => 404,
            SendError::Persistence(_) => 500,
        }
    }
}
