//! # Concord Framework
//!
//! The live dispatch path of the Concord bot framework.
//!
//! This layer provides:
//! - [`HandlerDescriptor`]s and the priority-ordered [`HandlerRegistry`]
//!   (plus [`SharedRegistry`], the copy-on-write wrapper readers snapshot)
//! - The [`Filter`] family attached to handlers: commands, command groups,
//!   regexes, message/adapter types, permissions and custom predicates
//! - [`EventContext`], the per-event state shared by every handler
//! - [`WakingCheckStage`], which turns an inbound message into the set of
//!   activated handlers, and the [`Pipeline`] that runs the stages in order
//!
//! ```text
//! MessageEvent ──▶ Pipeline ──▶ WakingCheckStage ──▶ ProcessStage ──▶ … ──▶ RespondStage
//!                     │               │
//!                     └── snapshot ◀──┘ HandlerRegistry (read-only per event)
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod handler;
pub mod llm;
pub mod outbound;
pub mod pipeline;
pub mod plugin;
pub mod registry;
pub mod session;
pub mod wake;

pub use config::WakeConfig;
pub use context::{EventContext, EventResult, Role};
pub use error::{
    DispatchError, FilterError, HandlerError, HandlerResult, OutboundAction, OutboundError,
    ParamError,
};
pub use filter::{
    AdapterTypeFilter, CommandFilter, CommandGroupFilter, CommandSpec, CustomFilter,
    EventMessageTypeFilter, Filter, ParamKind, ParamSchema, ParamSpec, ParamValue,
    PermissionFilter, PermissionType, RegexFilter,
};
pub use handler::{HandlerCall, HandlerDescriptor, HandlerFn, SourceOrigin, SourceRef, into_handler};
pub use llm::{ContentPart, ContextMessage, ProviderRequest, SharedRequest};
pub use outbound::{NoopOutbound, Outbound};
pub use pipeline::{
    HookStage, Pipeline, PipelineStage, ProcessStage, RespondStage, StageFlow, invoke_handler,
    run_hooks,
};
pub use plugin::{PluginMetadata, ToolDescriptor, ToolOrigin};
pub use registry::{HandlerRegistry, SharedRegistry};
pub use session::{AllowAllSessions, SessionPluginFilter, StaticSessionFilter};
pub use wake::WakingCheckStage;
