//! Error types for the disk agent core

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Error types surfaced by session management and block I/O
///
/// Session-management calls return these inline; I/O calls embed them in the
/// response object so that asynchronous failures travel through the same
/// future-resolution path as success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Stable error codes for code-level assertions and wire mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    InvalidSession,
    InvalidState,
    Io,
}

impl AgentError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        AgentError::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AgentError::NotFound(message.into())
    }

    pub fn invalid_session(message: impl Into<String>) -> Self {
        AgentError::InvalidSession(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        AgentError::InvalidState(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        AgentError::Io(message.into())
    }

    /// Map to the stable error code
    pub fn code(&self) -> ErrorCode {
        match self {
            AgentError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            AgentError::NotFound(_) => ErrorCode::NotFound,
            AgentError::InvalidSession(_) => ErrorCode::InvalidSession,
            AgentError::InvalidState(_) => ErrorCode::InvalidState,
            AgentError::Io(_) => ErrorCode::Io,
        }
    }

    /// Determine if this error should trigger a retry by the caller
    ///
    /// Fencing and ownership conflicts are never retried automatically by
    /// this layer; retry policy belongs to the caller. Validation errors are
    /// permanent. Only I/O failures are potentially transient.
    pub fn should_retry(&self) -> bool {
        match self {
            AgentError::Io(_) => true,

            AgentError::InvalidArgument(_) => false,
            AgentError::NotFound(_) => false,
            AgentError::InvalidSession(_) => false,
            AgentError::InvalidState(_) => false,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io(err.to_string())
    }
}
