//! Concord Runtime - configuration, logging and plugin lifecycle.
//!
//! This crate provides:
//! - Layered configuration loading (`ConfigLoader`, `ConcordConfig`)
//! - Logging setup from configuration (`LoggingBuilder`)
//! - The application root (`ConcordContext`), which owns the shared handler
//!   registry and exposes plugin load/unload/reload, live dispatch, pipeline
//!   snapshots and dry-run previews
//!
//! ```ignore
//! use concord_runtime::{ConcordContext, PluginUnit};
//! use concord_analysis::{PreviewRequest, Scope};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = ConcordContext::new()?;
//!     ctx.load_plugin(weather::plugin()).await?;
//!
//!     let snapshot = ctx.snapshot(&Scope::Global).await?;
//!     for conflict in &snapshot.conflicts {
//!         println!("{}: {}", conflict.conflict_type, conflict.title);
//!     }
//!
//!     let preview = ctx.preview(&PreviewRequest::new("qq:GroupMessage:42", "hi")).await?;
//!     println!("{}", preview.rendered_system_prompt);
//!     Ok(())
//! }
//! ```
//!
//! # Hot Reload
//!
//! `reload_plugin` unloads the old unit and installs the new one inside a
//! single exclusive section of the registry: events dispatched concurrently
//! see either the old handlers or the new ones, never a mix.

pub mod config;
pub mod context;
pub mod error;
pub mod logging;

// Re-exports
pub use config::{
    AnalysisConfig, ConcordConfig, ConfigError, ConfigLoader, ConfigResult, LoggingConfig,
};
pub use context::{ConcordContext, ContextBuilder, PluginUnit};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, LoggingError};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// This provides all the commonly used logging macros:
/// - `trace!`, `debug!`, `info!`, `warn!`, `error!`
/// - `span`, `event`
/// - `instrument` attribute
/// - `Level` for span creation
pub mod prelude {
    pub use tracing::{Level, debug, error, event, info, instrument, span, trace, warn};
}
