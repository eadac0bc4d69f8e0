use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Input rejected before anything is sent over the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("invalid email format: {0:?}")]
    InvalidEmail(String),
    #[error("group name is required")]
    MissingGroupName,
    #[error("at least one member is required")]
    NoGroupMembers,
}

/// Error frame pushed by the chat server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub message: String,
}

impl ServerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
