//! Configuration module for the Concord runtime.
//!
//! This module provides figment-based configuration loading and validation
//! for logging, the wake stage, static analysis and dry-run previews.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile};
pub use schema::{
    AnalysisConfig, ConcordConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig,
    SpanEventConfig,
};
pub use validation::validate_config;
