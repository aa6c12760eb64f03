//! Runtime error types.

use thiserror::Error;

use concord_analysis::AnalysisError;
use concord_framework::DispatchError;

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A snapshot or preview request was rejected.
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    /// Live dispatch terminated an event.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Plugin not loaded.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Plugin already loaded.
    #[error("Plugin already loaded: {0}")]
    PluginExists(String),

    /// A plugin unit carries a handler or tool owned by another module.
    #[error("Plugin '{plugin}' ships '{item}' owned by '{owner}'")]
    ForeignOwner {
        plugin: String,
        item: String,
        owner: String,
    },
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
