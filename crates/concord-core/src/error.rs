//! Error types for the Concord core data model.

use thiserror::Error;

/// Errors produced while building or parsing core data types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A unified message origin string did not have the
    /// `platform:message_type:session_id` shape.
    #[error("invalid message origin '{origin}': {reason}")]
    InvalidOrigin {
        /// The offending origin string.
        origin: String,
        /// Reason for failure.
        reason: String,
    },

    /// An unknown message type name.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// An unknown event type name.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}

impl CoreError {
    /// Creates an invalid-origin error.
    pub fn invalid_origin(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOrigin {
            origin: origin.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
