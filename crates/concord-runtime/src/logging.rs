//! Global log subscriber for Concord.
//!
//! Every crate in the workspace logs through `tracing`. Live dispatch runs
//! each event inside a `dispatch` span and the preview engine runs each chain
//! inside a `dry_run` span, so span events (see [`SpanEventConfig`]) are the
//! way to follow one event or one preview from start to end.
//!
//! `RUST_LOG`, when set, replaces the configured level and module filters.
//!
//! ```rust,ignore
//! use concord_runtime::config::{LogRotation, SpanEventConfig};
//! use concord_runtime::logging::LoggingBuilder;
//!
//! LoggingBuilder::new()
//!     .directive("concord_analysis::scanner=debug")
//!     .span_events(SpanEventConfig::LIFECYCLE)
//!     .file("logs/concord.log", LogRotation::Daily, 7)
//!     .try_init()?;
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, SpanEventConfig};

/// Why the subscriber was not installed.
#[derive(Error, Debug)]
pub enum LoggingError {
    /// File output without a file path.
    #[error("file output requires a file path")]
    MissingFilePath,

    /// The log file or its directory could not be opened.
    #[error("cannot open log file: {0}")]
    Appender(#[from] InitError),

    /// Another global subscriber is already installed.
    #[error("log subscriber already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Installs the subscriber described by `config`.
pub fn init_from_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    LoggingBuilder::from_config(config).try_init()
}

fn fmt_span(events: SpanEventConfig) -> FmtSpan {
    [
        (events.new, FmtSpan::NEW),
        (events.enter, FmtSpan::ENTER),
        (events.exit, FmtSpan::EXIT),
        (events.close, FmtSpan::CLOSE),
    ]
    .into_iter()
    .filter(|(on, _)| *on)
    .fold(FmtSpan::NONE, |acc, (_, flag)| acc | flag)
}

fn rotation(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Never => Rotation::NEVER,
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
    }
}

/// A log file and its rotation policy.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileSink {
    path: PathBuf,
    rotation: LogRotation,
    max_files: usize,
}

impl FileSink {
    fn appender(&self) -> Result<RollingFileAppender, InitError> {
        let dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = self
            .path
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or("concord.log");

        let mut builder = RollingFileAppender::builder()
            .rotation(rotation(self.rotation))
            .filename_prefix(name);
        if self.rotation != LogRotation::Never {
            builder = builder.max_log_files(self.max_files);
        }
        builder.build(dir)
    }
}

/// Assembles the global subscriber.
#[derive(Debug, Clone, Default)]
pub struct LoggingBuilder {
    level: LogLevel,
    directives: Vec<String>,
    span_events: SpanEventConfig,
    format: LogFormat,
    output: LogOutput,
    file: Option<FileSink>,
    thread_ids: bool,
    file_location: bool,
}

impl LoggingBuilder {
    /// Info level, compact lines on stdout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrors the `logging` config section.
    pub fn from_config(config: &LoggingConfig) -> Self {
        let mut builder = Self {
            level: config.level,
            directives: config
                .filters
                .iter()
                .map(|(module, level)| format!("{module}={level}"))
                .collect(),
            span_events: config.span_events,
            format: config.format,
            output: config.output,
            file: None,
            thread_ids: config.thread_ids,
            file_location: config.file_location,
        };
        if let Some(path) = &config.file_path {
            builder = builder.file(path, config.rotation, config.max_files);
        }
        builder
    }

    /// Global level.
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Adds an `EnvFilter` directive such as `concord_framework::wake=trace`.
    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn span_events(mut self, events: SpanEventConfig) -> Self {
        self.span_events = events;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Writes to `path` instead of a terminal stream.
    pub fn file(mut self, path: impl Into<PathBuf>, rotation: LogRotation, max_files: usize) -> Self {
        self.output = LogOutput::File;
        self.file = Some(FileSink {
            path: path.into(),
            rotation,
            max_files,
        });
        self
    }

    pub fn thread_ids(mut self, enabled: bool) -> Self {
        self.thread_ids = enabled;
        self
    }

    /// Includes the file and line of each event.
    pub fn file_location(mut self, enabled: bool) -> Self {
        self.file_location = enabled;
        self
    }

    /// The configured filter, e.g. `info,concord_analysis=trace`.
    fn directive_spec(&self) -> String {
        std::iter::once(self.level.as_str().to_string())
            .chain(self.directives.iter().cloned())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn env_filter(&self) -> EnvFilter {
        let spec = std::env::var(EnvFilter::DEFAULT_ENV)
            .ok()
            .filter(|spec| !spec.trim().is_empty())
            .unwrap_or_else(|| self.directive_spec());
        EnvFilter::builder().parse_lossy(spec)
    }

    fn writer(&self) -> Result<BoxMakeWriter, LoggingError> {
        match self.output {
            LogOutput::Stdout => Ok(BoxMakeWriter::new(std::io::stdout)),
            LogOutput::Stderr => Ok(BoxMakeWriter::new(std::io::stderr)),
            LogOutput::File => {
                let sink = self.file.as_ref().ok_or(LoggingError::MissingFilePath)?;
                Ok(BoxMakeWriter::new(sink.appender()?))
            }
        }
    }

    fn fmt_layer(&self, writer: BoxMakeWriter) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(self.output != LogOutput::File)
            .with_span_events(fmt_span(self.span_events))
            .with_thread_ids(self.thread_ids)
            .with_file(self.file_location)
            .with_line_number(self.file_location);
        match self.format {
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Full => layer.boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
            #[cfg(feature = "json-log")]
            LogFormat::Json => layer.json().boxed(),
        }
    }

    /// Installs the subscriber globally.
    pub fn try_init(self) -> Result<(), LoggingError> {
        let writer = self.writer()?;
        tracing_subscriber::registry()
            .with(self.fmt_layer(writer))
            .with(self.env_filter())
            .try_init()?;
        Ok(())
    }
}
