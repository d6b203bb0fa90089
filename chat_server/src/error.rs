use chat_protocol::SessionId;
use thiserror::Error;

/// Failures of the persistence store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

/// Errors surfaced while handling an inbound event.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid {event}: {reason}")]
    Validation { event: String, reason: String },
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("session is not registered")]
    NotRegistered,
}

impl ChatError {
    pub fn validation(event: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            event: event.into(),
            reason: reason.into(),
        }
    }

    /// Short machine readable reason sent back to the client.
    pub fn reason(&self) -> String {
        match self {
            ChatError::Validation { reason, .. } => reason.clone(),
            ChatError::Persistence(_) => "persistence_failed".into(),
            ChatError::UnknownSession(_) => "unknown_session".into(),
            ChatError::NotRegistered => "not_registered".into(),
        }
    }
}
