use shared::error::ValidationError;
use thiserror::Error;

/// Failure of the realtime connection. Reported through connection state and
/// logs; never surfaced to views as a raw error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("failed to connect websocket: {0}")]
    Connect(String),
    #[error("server rejected credentials (http {status})")]
    AuthRejected { status: u16 },
    #[error("connection lost: {0}")]
    Lost(String),
    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("invalid server url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Failure of one translation call. Recovered locally by the overlay.
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("translation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("translation service returned no text")]
    EmptyResponse,
    #[error("translation unavailable: {0}")]
    Unavailable(String),
}

/// Failure exchanging a backing identity for an application session. Always
/// fatal to the session.
#[derive(Debug, Error)]
pub enum AuthExchangeError {
    #[error("identity exchange request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("identity exchange returned no user record")]
    MissingUser,
    #[error("identity exchange rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Error)]
pub enum CreateChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("chat creation failed: {0}")]
    Rejected(String),
    #[error("no creation result from server within {seconds}s")]
    TimedOut { seconds: u64 },
}
