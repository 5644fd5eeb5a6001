//! Error taxonomy shared by the scheduler, stores and gateway.

use thiserror::Error;

/// Errors produced by Nudge components.
#[derive(Debug, Error)]
pub enum NudgeError {
    /// Notification or routine is absent, or not owned by the caller.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent response attempt, or a response to a terminal notification.
    /// Callers treat this as "already handled".
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Push to the transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Underlying persistence failed.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl NudgeError {
    /// True for outcomes the caller should ignore as "already being handled".
    pub fn is_conflict(&self) -> bool {
        matches!(self, NudgeError::Conflict(_))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        NudgeError::NotFound(what.into())
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        NudgeError::Conflict(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        NudgeError::InvalidArgument(reason.into())
    }

    pub fn store(reason: impl std::fmt::Display) -> Self {
        NudgeError::Store(reason.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NudgeError>;
