//! Configuration schema definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use concord_analysis::{DEFAULT_CALL_GRAPH_DEPTH, PreviewConfig};
use concord_framework::WakeConfig;

/// Root configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConcordConfig {
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Wake prefixes, admins and the plugin allowlist.
    #[serde(default)]
    pub wake: WakeConfig,

    /// Static analysis settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Dry-run preview settings.
    #[serde(default)]
    pub preview: PreviewConfig,
}

// =============================================================================
// Analysis
// =============================================================================

/// Static analysis settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Maximum depth of the persona call-graph walk.
    #[serde(default = "default_call_graph_depth")]
    pub call_graph_depth: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            call_graph_depth: default_call_graph_depth(),
        }
    }
}

fn default_call_graph_depth() -> usize {
    DEFAULT_CALL_GRAPH_DEPTH
}

// =============================================================================
// Logging
// =============================================================================

/// Log severity threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lowercase name, as used in filter directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// The matching `tracing` level.
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature.
    #[cfg(feature = "json-log")]
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// When the log file rolls over to a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Minutely,
    Hourly,
    Daily,
}

/// Which lifecycle events of the `dispatch` and `dry_run` spans are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanEventConfig {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

impl SpanEventConfig {
    /// Nothing.
    pub const NONE: Self = Self {
        new: false,
        enter: false,
        exit: false,
        close: false,
    };

    /// Creation and close: one line when an event or dry run starts and one when it ends.
    pub const LIFECYCLE: Self = Self {
        new: true,
        enter: false,
        exit: false,
        close: true,
    };

    /// Everything, including an exit/enter pair at every await point.
    pub const FULL: Self = Self {
        new: true,
        enter: true,
        exit: true,
        close: true,
    };
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Global level; `RUST_LOG` takes precedence when set.
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Log file, required when `output` is `file`. Rotated files get a
    /// date suffix after the file name.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub rotation: LogRotation,

    /// Rotated files kept; older ones are deleted. Ignored when `rotation` is `never`.
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    #[serde(default)]
    pub thread_ids: bool,

    /// Include file and line of each event.
    #[serde(default)]
    pub file_location: bool,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Per-module levels, e.g. `concord_analysis = "debug"`.
    #[serde(default)]
    pub filters: BTreeMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: None,
            rotation: LogRotation::default(),
            max_files: default_max_files(),
            thread_ids: false,
            file_location: false,
            span_events: SpanEventConfig::default(),
            filters: BTreeMap::new(),
        }
    }
}

fn default_max_files() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_default_when_missing() {
        let config: ConcordConfig = serde_json::from_str(r#"{"wake": {"wake_prefix": ["!"]}}"#).unwrap();

        assert_eq!(config.wake.wake_prefix, vec!["!".to_string()]);
        assert!(config.wake.ignore_bot_self_message);
        assert_eq!(config.analysis.call_graph_depth, DEFAULT_CALL_GRAPH_DEPTH);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.preview, PreviewConfig::default());
    }

    #[test]
    fn test_log_level_names() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"level": "debug", "filters": {"concord_analysis": "trace"}}"#)
                .unwrap();

        assert_eq!(config.level.to_tracing_level(), tracing::Level::DEBUG);
        assert_eq!(config.filters["concord_analysis"].as_str(), "trace");
        assert!(serde_json::from_str::<LogLevel>(r#""loud""#).is_err());
    }

    #[test]
    fn test_rotation_settings() {
        let config: LoggingConfig = serde_json::from_str(
            r#"{"output": "file", "file_path": "logs/concord.log", "rotation": "daily", "max_files": 7}"#,
        )
        .unwrap();
        assert_eq!(config.rotation, LogRotation::Daily);
        assert_eq!(config.max_files, 7);

        let config = LoggingConfig::default();
        assert_eq!(config.rotation, LogRotation::Never);
        assert_eq!(config.max_files, 5);
    }
}
