use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the toolbox core and its adapters.
///
/// `Clone` so that a single failed creation can be handed to every caller
/// that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum ToolboxError {
    #[error("session already exists: {0}")]
    DuplicateSession(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("service {key} is not a {expected}")]
    ServiceType { key: String, expected: &'static str },

    #[error("service {0} was invalidated while it was being created")]
    Invalidated(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("{0}")]
    Other(String),
}

impl ToolboxError {
    /// Whether this error only reports a missing session or record.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_) | Self::NotFound(_))
    }
}

impl From<std::io::Error> for ToolboxError {
    fn from(e: std::io::Error) -> Self {
        ToolboxError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for ToolboxError {
    fn from(e: serde_json::Error) -> Self {
        ToolboxError::InvalidMessage(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ToolboxError {
    fn from(e: tokio::task::JoinError) -> Self {
        ToolboxError::Other(format!("join error: {e}"))
    }
}

pub type ToolboxResult<T> = Result<T, ToolboxError>;
