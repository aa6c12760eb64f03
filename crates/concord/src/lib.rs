//! # Concord
//!
//! Handler dispatch and plugin-interaction analysis for multi-platform chat
//! bots.
//!
//! ## Overview
//!
//! Plugins register handlers for event types. An inbound message is woken,
//! matched against command and filter rules, and run through the activated
//! handlers in priority order. Next to this live path, Concord explains how
//! the loaded plugins will interact before real traffic reaches them: which
//! handlers edit the LLM prompt, which stop events, which fight over the
//! same command, and what the prompt actually looks like after every
//! `on_llm_request` handler has run.
//!
//! ## Architecture
//!
//! ```text
//!                        ┌───────────────────── live path ─────────────────────┐
//! MessageEvent ─────────▶│ Waking ─▶ Process ─▶ ResultDecorate ─▶ Respond      │──▶ Outbound
//!                        └──────────────▲──────────────────────────────────────┘
//!                                       │ snapshot
//! PluginUnit ──load/reload──▶ SharedRegistry
//!                                       │ snapshot
//!                        ┌──────────────▼──────── diagnostic path ─────────────┐
//!                        │ RiskScanner ─▶ SnapshotBuilder ─▶ Detectors         │──▶ Snapshot
//!                        │ DryRunEngine (sandboxed outbound, attribution)      │──▶ PreviewResult
//!                        └─────────────────────────────────────────────────────┘
//! ```
//!
//! - **Core**: events, message chains, origins, event types and stages
//! - **Framework**: handler registry, filters, wake & dispatch, pipeline
//! - **Analysis**: static risk scanning, snapshots, conflict detection and
//!   dry-run prompt previews
//! - **Runtime**: configuration, logging and plugin lifecycle
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use concord::prelude::*;
//!
//! async fn ping(call: HandlerCall) -> HandlerResult {
//!     call.ctx.set_result(EventResult::text("pong"));
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = ConcordContext::new()?;
//!     ctx.load_plugin(
//!         PluginUnit::new(PluginMetadata::new("ping", "plugins.ping")).handler(
//!             HandlerDescriptor::new(EventType::AdapterMessage, "plugins.ping", "ping", into_handler(ping))
//!                 .with_filter(CommandFilter::new("ping")),
//!         ),
//!     )
//!     .await?;
//!
//!     let snapshot = ctx.snapshot(&Scope::Global).await?;
//!     println!("{} conflict(s)", snapshot.conflicts.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: load `concord.toml` (default)
//! - `yaml-config`: load `concord.yaml`
//! - `json-log`: JSON log output

pub use concord_analysis as analysis;
pub use concord_core as core;
pub use concord_framework as framework;
pub use concord_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use concord::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use concord_runtime::{ConcordConfig, ConcordContext, PluginUnit};

    // Core data model
    pub use concord_core::{EventType, MessageChain, MessageEvent, MessageOrigin, MessageType};

    // Handlers and filters
    pub use concord_framework::{
        CommandFilter, CommandGroupFilter, CustomFilter, EventMessageTypeFilter, EventResult,
        HandlerCall, HandlerDescriptor, HandlerError, HandlerResult, ParamKind, ParamSpec,
        PermissionFilter, PermissionType, PluginMetadata, RegexFilter, into_handler,
    };

    // Diagnostics
    pub use concord_analysis::{
        Conflict, ConflictType, PreviewRequest, PreviewResult, Scope, Severity, Snapshot,
    };
}
