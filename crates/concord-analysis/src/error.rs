//! Error types for the analysis layer.

use std::path::Path;

use thiserror::Error;

use concord_core::CoreError;

/// Why a handler's source could not be scanned.
///
/// Scan errors never abort a snapshot: the scanner logs them once per cause
/// and falls back to declared or unknown effects.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    /// The handler carries no source reference, or the file cannot be read.
    #[error("source unavailable for {target}: {reason}")]
    SourceUnavailable {
        /// File path or handler name.
        target: String,
        /// Reason.
        reason: String,
    },

    /// The source text is not valid Rust.
    #[error("failed to parse {origin}: {message}")]
    Parse {
        /// File path or `<inline>`.
        origin: String,
        /// Parser message.
        message: String,
    },

    /// The handler function is not defined in the source.
    #[error("function '{function}' not found in {origin}")]
    FunctionNotFound {
        /// Function name.
        function: String,
        /// File path or `<inline>`.
        origin: String,
    },
}

impl ScanError {
    pub(crate) fn unreadable(path: &Path, err: &std::io::Error) -> Self {
        Self::SourceUnavailable {
            target: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}

/// Errors from snapshot building and dry-run previews.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// A session scope or preview origin is not a valid UMO.
    #[error("invalid session origin: {0}")]
    InvalidOrigin(#[from] CoreError),

    /// A session-scoped request needs a session filter.
    #[error("session scope requested but no session filter is configured")]
    NoSessionFilter,
}

/// Result type for analysis operations.
pub type AnalysisResult<T> = Result<T, AnalysisError>;
