//! Error types for the Concord framework.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised by a filter while evaluating an event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterError {
    /// A permission filter rejected the sender and is configured to fail
    /// loudly instead of silently skipping the handler.
    #[error("user {sender_id} lacks permission to run this handler")]
    PermissionDenied {
        /// The rejected sender.
        sender_id: String,
    },

    /// The filter itself failed.
    #[error("filter '{filter}' failed: {message}")]
    Evaluation {
        /// Filter name.
        filter: String,
        /// Failure description.
        message: String,
    },
}

impl FilterError {
    /// Creates an evaluation error.
    pub fn evaluation(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Evaluation {
            filter: filter.into(),
            message: message.into(),
        }
    }
}

/// Argument validation failures for command parameters.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParamError {
    /// A required argument was not supplied.
    #[error("missing required argument '{name}'")]
    Missing {
        /// Parameter name.
        name: String,
    },

    /// More arguments than declared parameters.
    #[error("too many arguments: expected at most {expected}, got {got}")]
    TooMany {
        /// Declared parameter count.
        expected: usize,
        /// Supplied argument count.
        got: usize,
    },

    /// An argument could not be converted to its declared type.
    #[error("argument '{name}' expects {expected}, got '{value}'")]
    TypeMismatch {
        /// Parameter name.
        name: String,
        /// Expected type name.
        expected: &'static str,
        /// The raw argument.
        value: String,
    },
}

/// A side-effecting action a handler can request through the outbound API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundAction {
    /// Send a message.
    Send,
    /// Send a streamed message.
    Stream,
    /// React to a message.
    React,
    /// Issue a nested LLM request.
    LlmRequest,
}

impl fmt::Display for OutboundAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Send => "send",
            Self::Stream => "stream",
            Self::React => "react",
            Self::LlmRequest => "llm_request",
        })
    }
}

/// Errors from the outbound messaging API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutboundError {
    /// The action was intercepted and not performed (dry-run).
    #[error("side effect '{action}' blocked")]
    Blocked {
        /// The intercepted action.
        action: OutboundAction,
    },

    /// The platform refused or failed the action.
    #[error("outbound {action} failed: {reason}")]
    SendFailed {
        /// The failed action.
        action: OutboundAction,
        /// Reason for failure.
        reason: String,
    },
}

impl OutboundError {
    /// Returns `true` for the dry-run interception signal.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Errors returned by handler bodies.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// An outbound call failed or was blocked.
    #[error(transparent)]
    Outbound(#[from] OutboundError),

    /// Any other handler failure.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Creates a generic handler failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Returns `true` when the handler was short-circuited by a blocked side effect.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Outbound(e) if e.is_blocked())
    }
}

/// Result type for handler bodies.
pub type HandlerResult = Result<(), HandlerError>;

/// Errors raised by pipeline stages.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// A filter failed unexpectedly; the event is terminated.
    #[error("plugin '{plugin}' filter failed in handler {handler}: {source}")]
    FilterEvaluation {
        /// Display name of the plugin owning the handler.
        plugin: String,
        /// Full name of the handler.
        handler: String,
        /// The underlying failure.
        #[source]
        source: FilterError,
    },

    /// An outbound call made by the stage itself failed.
    #[error(transparent)]
    Outbound(#[from] OutboundError),
}
