//! Dry-run prompt previews.
//!
//! The [`DryRunEngine`] runs the real `on_llm_request` handler chain against
//! a synthetic event whose outbound API is a [`SandboxOutbound`]: every send,
//! stream, reaction or nested LLM request is recorded and answered with a
//! blocked error instead of reaching a platform. Each handler's edits to the
//! request are attributed character by character to the handler that made
//! them.
//!
//! ```text
//! PreviewRequest ──▶ synthetic event (woken) ──▶ on_llm_request chain ──▶ PreviewResult
//!                                                   │        │
//!                                    SandboxOutbound ┘        └ SegmentTracker / PartsTracker
//! ```

pub mod attribution;
pub mod sandbox;

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{Instrument, Level, debug, info, span, warn};

use concord_core::{
    EventType, MessageChain, MessageEvent, MessageOrigin, MessageType, PlatformMeta, Sender,
};
use concord_framework::{
    ContextMessage, EventContext, HandlerCall, HandlerDescriptor, HandlerRegistry, Outbound,
    OutboundAction, ProviderRequest, Role, SessionPluginFilter, WakeConfig, invoke_handler,
};

pub use attribution::{
    Actor, AttributedPart, Attribution, HandlerStatus, MutationKind, PartsTracker, PromptField,
    PromptSegment, SegmentTracker,
};
pub use sandbox::{BlockedAttempt, SandboxOutbound};

use crate::error::AnalysisResult;
use crate::scanner::RiskScanner;
use crate::snapshot::DEFAULT_CALL_GRAPH_DEPTH;

// =============================================================================
// Configuration and requests
// =============================================================================

/// Dry-run settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Handlers running at least this long are reported as slow.
    pub slow_handler_ms: u64,
    /// Sender id of the synthetic event when the request names none.
    pub default_sender_id: String,
    /// Sender nickname of the synthetic event when the request names none.
    pub default_sender_name: String,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            slow_handler_ms: 500,
            default_sender_id: "preview-user".to_string(),
            default_sender_name: "Preview".to_string(),
        }
    }
}

/// The persona applied to the previewed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaSpec {
    /// Persona name.
    pub name: String,
    /// Raw persona prompt text.
    pub prompt: String,
    /// The persona text is already in `system_prompt` before the chain runs.
    #[serde(default)]
    pub pre_applied: bool,
}

/// What to preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    /// Session UMO, `platform:message_type:session_id`.
    pub origin: String,
    /// Text of the synthetic user message.
    pub message: String,
    /// Sender id; defaults to [`PreviewConfig::default_sender_id`].
    #[serde(default)]
    pub sender_id: Option<String>,
    /// Sender nickname; defaults to [`PreviewConfig::default_sender_name`].
    #[serde(default)]
    pub sender_name: Option<String>,
    /// The session's persona, if any.
    #[serde(default)]
    pub persona: Option<PersonaSpec>,
    /// Conversation history handed to the request.
    #[serde(default)]
    pub contexts: Vec<ContextMessage>,
}

impl PreviewRequest {
    /// Creates a request for `message` in the session `origin`.
    pub fn new(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            message: message.into(),
            sender_id: None,
            sender_name: None,
            persona: None,
            contexts: Vec::new(),
        }
    }

    /// Sets the persona (builder style).
    pub fn with_persona(mut self, persona: PersonaSpec) -> Self {
        self.persona = Some(persona);
        self
    }

    /// Sets the sender (builder style).
    pub fn with_sender(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.sender_id = Some(id.into());
        self.sender_name = Some(name.into());
        self
    }

    /// Sets the conversation history (builder style).
    pub fn with_contexts(mut self, contexts: Vec<ContextMessage>) -> Self {
        self.contexts = contexts;
        self
    }
}

// =============================================================================
// Result document
// =============================================================================

/// Warning categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// A handler attempted a side effect.
    BlockedEffect,
    /// A handler stopped the event.
    Stopped,
    /// A change could not be attributed precisely.
    NonAttributable,
    /// Attribution was reset after its reconstruction diverged.
    AttributionReset,
    /// A handler exceeded the slow threshold.
    SlowHandler,
    /// The prompt ended up empty and was replaced by the message text.
    EmptyResultFallback,
    /// A handler removed text without adding any; the loss is not visible in the segments.
    TextDeleted,
}

/// One preview warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewWarning {
    /// Category.
    pub kind: WarningKind,
    /// Handler full name, when caused by one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Human-readable message.
    pub message: String,
}

/// How one handler changed a text field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field: PromptField,
    pub mutation: MutationKind,
}

/// What happened to one handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRecord {
    /// Owning plugin's module id.
    pub plugin: String,
    /// Handler full name.
    pub handler: String,
    /// Handler priority.
    pub priority: i64,
    /// Outcome.
    pub status: HandlerStatus,
    /// Wall time spent in the handler.
    pub duration_ms: u64,
    /// Side effects the handler attempted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_actions: Vec<OutboundAction>,
    /// Error message, for errored handlers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why the handler did not run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// The handler stopped the event.
    #[serde(default)]
    pub stopped_event: bool,
    /// Request fields the handler changed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<PromptField>,
    /// Classification of each text-field change.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutations: Vec<FieldChange>,
}

/// Shape of the conversation history passed to the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextsSummary {
    /// Number of history turns.
    pub count: usize,
    /// Turns per role.
    pub by_role: BTreeMap<String, usize>,
    /// Characters across every turn.
    pub total_chars: usize,
}

impl ContextsSummary {
    fn of(contexts: &[ContextMessage]) -> Self {
        let mut summary = Self {
            count: contexts.len(),
            ..Self::default()
        };
        for turn in contexts {
            *summary.by_role.entry(turn.role.clone()).or_default() += 1;
            summary.total_chars += turn.content.chars().count();
        }
        summary
    }
}

/// Attributed segments per request field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributedSegments {
    /// Segments of `system_prompt`.
    pub system_prompt: Vec<PromptSegment>,
    /// Segments of `prompt`.
    pub prompt: Vec<PromptSegment>,
    /// Extra content parts.
    pub extra_user_content_parts: Vec<AttributedPart>,
}

/// The outcome of one dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResult {
    /// Final `prompt`.
    pub prompt: String,
    /// Final `system_prompt`.
    pub system_prompt: String,
    /// History passed to the chain.
    pub contexts_summary: ContextsSummary,
    /// The user turn as a provider would receive it.
    pub rendered_prompt: String,
    /// The system prompt as a provider would receive it.
    pub rendered_system_prompt: String,
    /// Attribution per field.
    pub attributed_segments: AttributedSegments,
    /// Warnings, in chain order.
    pub warnings: Vec<PreviewWarning>,
    /// One record per handler in the chain.
    pub handler_records: Vec<HandlerRecord>,
}

impl PreviewResult {
    /// Warnings of one kind.
    pub fn warnings_of(&self, kind: WarningKind) -> impl Iterator<Item = &PreviewWarning> {
        self.warnings.iter().filter(move |w| w.kind == kind)
    }

    /// The record of the handler named `full_name`.
    pub fn record(&self, full_name: &str) -> Option<&HandlerRecord> {
        self.handler_records.iter().find(|r| r.handler == full_name)
    }
}

fn render_user_turn(request: &ProviderRequest) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !request.prompt.is_empty() {
        parts.push(request.prompt.clone());
    }
    parts.extend(request.extra_user_content_parts.iter().map(|p| p.render()));
    parts.extend(request.image_urls.iter().map(|url| format!("[image: {url}]")));
    parts.join("\n")
}

// =============================================================================
// Engine
// =============================================================================

/// Runs `on_llm_request` chains with side effects blocked.
pub struct DryRunEngine {
    config: PreviewConfig,
    wake: Arc<WakeConfig>,
    sessions: Option<Arc<dyn SessionPluginFilter>>,
    scanner: Option<Arc<RiskScanner>>,
    call_graph_depth: usize,
}

/// Mutable state threaded through one dry run.
struct ChainState {
    system: SegmentTracker,
    prompt: SegmentTracker,
    parts: PartsTracker,
    warnings: Vec<PreviewWarning>,
    records: Vec<HandlerRecord>,
}

impl ChainState {
    fn warn(&mut self, kind: WarningKind, handler: Option<&str>, message: impl Into<String>) {
        self.warnings.push(PreviewWarning {
            kind,
            handler: handler.map(str::to_string),
            message: message.into(),
        });
    }

    fn skip(&mut self, handler: &HandlerDescriptor, reason: impl Into<String>) {
        self.records.push(HandlerRecord {
            plugin: handler.module_path.clone(),
            handler: handler.full_name.clone(),
            priority: handler.priority(),
            status: HandlerStatus::Skipped,
            duration_ms: 0,
            blocked_actions: Vec::new(),
            error: None,
            skip_reason: Some(reason.into()),
            stopped_event: false,
            changed_fields: Vec::new(),
            mutations: Vec::new(),
        });
    }
}

impl DryRunEngine {
    /// Creates an engine using `wake` for filter evaluation and the plugin
    /// allowlist.
    pub fn new(config: PreviewConfig, wake: Arc<WakeConfig>) -> Self {
        Self {
            config,
            wake,
            sessions: None,
            scanner: None,
            call_graph_depth: DEFAULT_CALL_GRAPH_DEPTH,
        }
    }

    /// Drops handlers of plugins disabled in the previewed session.
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionPluginFilter>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Uses `scanner` to find plugins that edit persona text outside dispatch.
    pub fn with_scanner(mut self, scanner: Arc<RiskScanner>, call_graph_depth: usize) -> Self {
        self.scanner = Some(scanner);
        self.call_graph_depth = call_graph_depth;
        self
    }

    /// Runs the `on_llm_request` chain of `registry` for `request`.
    pub async fn preview(
        &self,
        registry: &HandlerRegistry,
        request: &PreviewRequest,
    ) -> AnalysisResult<PreviewResult> {
        let origin: MessageOrigin = request.origin.parse()?;
        let span = span!(Level::DEBUG, "dry_run", origin = %origin);
        Ok(self.run(registry, request, origin).instrument(span).await)
    }

    async fn run(
        &self,
        registry: &HandlerRegistry,
        request: &PreviewRequest,
        origin: MessageOrigin,
    ) -> PreviewResult {
        let sandbox = Arc::new(SandboxOutbound::new());
        let event = self.synthetic_event(&origin, request);
        let ctx = Arc::new(EventContext::new(
            event,
            Arc::clone(&sandbox) as Arc<dyn Outbound>,
        ));
        ctx.mark_woken(false);
        if self.wake.is_admin(ctx.sender_id()) {
            ctx.set_role(Role::Admin);
        }

        let mut initial = ProviderRequest::new(ctx.message_str());
        initial.contexts = request.contexts.clone();
        let persona = request.persona.as_ref();
        let system = match persona {
            Some(p) if p.pre_applied => {
                initial.system_prompt = p.prompt.clone();
                SegmentTracker::with_persona_applied(PromptField::SystemPrompt, &p.name, &p.prompt)
            }
            Some(p) => SegmentTracker::new(PromptField::SystemPrompt, "").with_persona(&p.name, &p.prompt),
            None => SegmentTracker::new(PromptField::SystemPrompt, ""),
        };
        let mut state = ChainState {
            system,
            prompt: SegmentTracker::new(PromptField::Prompt, &initial.prompt),
            parts: PartsTracker::new(&initial.extra_user_content_parts),
            warnings: Vec::new(),
            records: Vec::new(),
        };
        let collaborator = match persona {
            Some(_) => self.persona_collaborator(registry),
            None => None,
        };
        let shared = initial.shared();

        let handlers = self.chain(registry, &origin).await;
        debug!(handlers = handlers.len(), "Running dry-run chain");

        for handler in &handlers {
            if ctx.is_stopped() {
                state.skip(handler, "event stopped by an earlier handler");
                continue;
            }
            if let Some(reason) = self.filter_rejection(handler, &ctx) {
                state.skip(handler, reason);
                continue;
            }

            let before = shared.lock().clone();
            let attempts_before = sandbox.attempt_count();
            let started = Instant::now();
            let call = HandlerCall {
                ctx: Arc::clone(&ctx),
                request: Some(Arc::clone(&shared)),
                params: Vec::new(),
            };
            let outcome = invoke_handler(handler, call).await;
            let elapsed = started.elapsed();
            let after = shared.lock().clone();
            let blocked: Vec<OutboundAction> = sandbox
                .attempts_since(attempts_before)
                .into_iter()
                .map(|a| a.action)
                .collect();

            let (status, error) = match outcome {
                Ok(()) if blocked.is_empty() => (HandlerStatus::Executed, None),
                Ok(()) => (HandlerStatus::Blocked, None),
                Err(e) if e.is_blocked() || !blocked.is_empty() => {
                    (HandlerStatus::Blocked, Some(e.to_string()))
                }
                Err(e) => {
                    warn!(handler = %handler.full_name, error = %e, "Dry-run handler failed");
                    (HandlerStatus::Errored, Some(e.to_string()))
                }
            };

            let actor = Actor {
                plugin: handler.module_path.clone(),
                handler: handler.full_name.clone(),
                priority: handler.priority(),
                status,
            };
            let (changed_fields, mutations) =
                Self::attribute(&mut state, &before, &after, &actor, collaborator.as_ref());
            let stopped_event = ctx.is_stopped();
            let name = Some(handler.full_name.as_str());

            if !blocked.is_empty() {
                let actions: Vec<String> = blocked.iter().map(|a| a.to_string()).collect();
                state.warn(
                    WarningKind::BlockedEffect,
                    name,
                    format!("blocked side effects: {}", actions.join(", ")),
                );
            }
            if stopped_event {
                state.warn(
                    WarningKind::Stopped,
                    name,
                    "stopped the event; later handlers in the chain were not run",
                );
            }
            if elapsed >= Duration::from_millis(self.config.slow_handler_ms) {
                state.warn(
                    WarningKind::SlowHandler,
                    name,
                    format!("took {} ms", elapsed.as_millis()),
                );
            }

            state.records.push(HandlerRecord {
                plugin: actor.plugin,
                handler: actor.handler,
                priority: actor.priority,
                status,
                duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                blocked_actions: blocked,
                error,
                skip_reason: None,
                stopped_event,
                changed_fields,
                mutations,
            });
        }

        let final_request = shared.lock().clone();
        self.finish(state, final_request, ctx.message_str(), &request.contexts, handlers.len())
    }

    /// The `on_llm_request` chain for `origin`, in priority then name order.
    async fn chain(&self, registry: &HandlerRegistry, origin: &MessageOrigin) -> Vec<Arc<HandlerDescriptor>> {
        let allowlist = self.wake.plugin_allowlist();
        let mut handlers = registry.get(EventType::OnLlmRequest, true, allowlist.as_deref());
        if let Some(sessions) = &self.sessions {
            handlers = sessions.filter_by_session(origin, handlers, registry).await;
        }
        handlers.sort_by(|a, b| {
            (Reverse(a.priority()), &a.full_name).cmp(&(Reverse(b.priority()), &b.full_name))
        });
        handlers
    }

    fn synthetic_event(&self, origin: &MessageOrigin, request: &PreviewRequest) -> MessageEvent {
        let sender = Sender {
            user_id: request
                .sender_id
                .clone()
                .unwrap_or_else(|| self.config.default_sender_id.clone()),
            nickname: Some(
                request
                    .sender_name
                    .clone()
                    .unwrap_or_else(|| self.config.default_sender_name.clone()),
            ),
        };
        let event = MessageEvent::new(
            PlatformMeta {
                name: "dry_run".to_string(),
                id: origin.platform_id.clone(),
            },
            origin.message_type,
            origin.session_id.clone(),
            "dry-run-bot",
            sender,
            MessageChain::new().text(request.message.clone()),
        );
        match origin.message_type {
            MessageType::GroupMessage => event.with_group(origin.session_id.clone()),
            _ => event,
        }
    }

    /// Evaluates every non-command filter. Returns the reason for skipping.
    fn filter_rejection(&self, handler: &HandlerDescriptor, ctx: &EventContext) -> Option<String> {
        for filter in handler.filters.iter().filter(|f| !f.is_command()) {
            match filter.matches(ctx, &self.wake) {
                Ok(true) => {}
                Ok(false) => return Some(format!("filter {} rejected the event", filter.label())),
                Err(e) => return Some(format!("filter {} failed: {e}", filter.label())),
            }
        }
        None
    }

    /// The first plugin whose initialization code edits persona text.
    fn persona_collaborator(&self, registry: &HandlerRegistry) -> Option<Actor> {
        let scanner = self.scanner.as_ref()?;
        let mut seen = Vec::new();
        for handler in registry.handlers() {
            let Some(source) = &handler.source else { continue };
            if seen.contains(&&source.origin) {
                continue;
            }
            seen.push(&source.origin);
            let Ok(found) = scanner.scan_persona(source, self.call_graph_depth) else {
                continue;
            };
            if let Some(mutation) = found.first() {
                debug!(
                    plugin = %handler.module_path,
                    chain = %mutation.call_chain.join(" -> "),
                    "Persona collaborator found"
                );
                return Some(Actor {
                    plugin: handler.module_path.clone(),
                    handler: mutation
                        .call_chain
                        .last()
                        .cloned()
                        .unwrap_or_else(|| handler.module_path.clone()),
                    priority: 0,
                    status: HandlerStatus::Executed,
                });
            }
        }
        None
    }

    /// Feeds one handler's before/after request into the trackers.
    fn attribute(
        state: &mut ChainState,
        before: &ProviderRequest,
        after: &ProviderRequest,
        actor: &Actor,
        collaborator: Option<&Actor>,
    ) -> (Vec<PromptField>, Vec<FieldChange>) {
        let mut changed = Vec::new();
        let mut mutations = Vec::new();
        let name = Some(actor.handler.as_str());
        let resets = state.system.resets() + state.prompt.resets();

        let text_changes = [
            (
                PromptField::SystemPrompt,
                state
                    .system
                    .record(&before.system_prompt, &after.system_prompt, actor, collaborator),
            ),
            (
                PromptField::Prompt,
                state.prompt.record(&before.prompt, &after.prompt, actor, None),
            ),
        ];
        for (field, kind) in text_changes {
            let Some(mutation) = kind else { continue };
            changed.push(field);
            mutations.push(FieldChange { field, mutation });
            if mutation == MutationKind::Delete {
                state.warn(
                    WarningKind::TextDeleted,
                    name,
                    format!("removed text from {} without replacing it", field.as_str()),
                );
            }
        }

        if before.extra_user_content_parts != after.extra_user_content_parts {
            changed.push(PromptField::ExtraUserContentParts);
            if !state.parts.record(
                &before.extra_user_content_parts,
                &after.extra_user_content_parts,
                actor,
            ) {
                state.warn(
                    WarningKind::NonAttributable,
                    name,
                    "extra content parts were edited in place; the list is shown unattributed",
                );
            }
        }

        if state.system.resets() + state.prompt.resets() > resets {
            warn!(handler = %actor.handler, "Prompt attribution diverged and was reset");
            state.warn(
                WarningKind::AttributionReset,
                name,
                "attribution diverged from the request text and was reset",
            );
        }
        (changed, mutations)
    }

    fn finish(
        &self,
        mut state: ChainState,
        request: ProviderRequest,
        message: String,
        contexts: &[ContextMessage],
        chain_len: usize,
    ) -> PreviewResult {
        let mut prompt = request.prompt.clone();
        let mut rendered_prompt = render_user_turn(&request);
        let prompt_segments = if rendered_prompt.trim().is_empty() && !message.is_empty() {
            state.warn(
                WarningKind::EmptyResultFallback,
                None,
                "the chain left the prompt empty; showing the original message instead",
            );
            prompt = message.clone();
            rendered_prompt = message.clone();
            vec![PromptSegment::new(message, None)]
        } else {
            state.prompt.finalize()
        };

        info!(
            handlers = chain_len,
            warnings = state.warnings.len(),
            "Dry-run preview finished"
        );

        PreviewResult {
            prompt,
            rendered_system_prompt: request.system_prompt.trim().to_string(),
            system_prompt: request.system_prompt,
            contexts_summary: ContextsSummary::of(contexts),
            rendered_prompt,
            attributed_segments: AttributedSegments {
                system_prompt: state.system.finalize(),
                prompt: prompt_segments,
                extra_user_content_parts: state.parts.into_parts(),
            },
            warnings: state.warnings,
            handler_records: state.records,
        }
    }
}

impl std::fmt::Debug for DryRunEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DryRunEngine")
            .field("config", &self.config)
            .field("call_graph_depth", &self.call_graph_depth)
            .field("has_sessions", &self.sessions.is_some())
            .field("has_scanner", &self.scanner.is_some())
            .finish_non_exhaustive()
    }
}
