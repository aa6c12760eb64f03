//! # Concord Analysis
//!
//! The diagnostic path of the Concord bot framework: it explains how
//! plugins will interact before real traffic reaches them.
//!
//! This layer provides:
//! - The [`RiskScanner`], which parses handler source with `syn` and infers
//!   side effects without running anything, falling back to declared
//!   [`EffectManifest`]s and then to conservative assumptions
//! - A bounded, cycle-safe call-graph walk that finds persona edits made
//!   during plugin initialization
//! - The [`SnapshotBuilder`], which lays handlers out per pipeline stage
//!   and runs the conflict [`Detector`]s over the result
//! - The [`DryRunEngine`], which runs the real `on_llm_request` chain with
//!   side effects blocked and attributes every character of the resulting
//!   prompts to the handler that wrote it
//!
//! ```text
//! HandlerRegistry ──▶ RiskScanner ──▶ SnapshotBuilder ──▶ Detectors ──▶ Snapshot
//!        │                                                                 ▲
//!        └────────────────────────▶ DryRunEngine ──▶ PreviewResult ────────┘ (optional)
//! ```

pub mod callgraph;
pub mod detectors;
pub mod effect;
pub mod error;
pub mod manifest;
pub mod preview;
pub mod scanner;
pub mod snapshot;

pub use callgraph::PersonaMutation;
pub use detectors::{
    CommandConflictDetector, Conflict, ConflictType, Detector, DetectorInput,
    DuplicateSendDetector, Involved, PriorityTieDetector, PromptOverwriteDetector,
    ResultChainMutationDetector, Severity, StopInterceptionDetector, ToolNameDetector,
    default_detectors, run_detectors,
};
pub use effect::{
    Confidence, Effect, EffectOperation, EffectTarget, HandlerEffects, Provenance, RiskSummary,
    SourceLocation,
};
pub use error::{AnalysisError, AnalysisResult, ScanError};
pub use manifest::{DeclaredEffect, EffectManifest};
pub use preview::{
    DryRunEngine, FieldChange, HandlerRecord, HandlerStatus, PersonaSpec, PreviewConfig,
    PreviewRequest, PreviewResult, PreviewWarning, PromptSegment, WarningKind,
};
pub use scanner::{RiskScanner, fallback_effects};
pub use snapshot::{
    DEFAULT_CALL_GRAPH_DEPTH, Participant, PluginSummary, Scope, Snapshot, SnapshotBuilder,
    SnapshotStats, StageTopology, snapshot_id,
};
