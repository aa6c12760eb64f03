//! The per-event pipeline scheduler.
//!
//! A [`Pipeline`] owns an ordered list of [`PipelineStage`]s and runs them for
//! one event at a time. Stages run in [`Stage`] order; within a stage,
//! handlers run strictly sequentially in registry order. Distinct events are
//! dispatched concurrently by calling [`Pipeline::dispatch`] from separate
//! tasks, each of which reads its own registry snapshot.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{Instrument, Level, debug, error, span, warn};

use concord_core::{EventType, Stage};

use crate::config::WakeConfig;
use crate::context::EventContext;
use crate::error::{DispatchError, HandlerError};
use crate::handler::{HandlerCall, HandlerDescriptor};
use crate::llm::SharedRequest;
use crate::registry::{HandlerRegistry, SharedRegistry};
use crate::session::SessionPluginFilter;
use crate::wake::WakingCheckStage;

/// Whether the pipeline continues after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlow {
    /// Run the next stage.
    Continue,
    /// Skip the remaining stages (the respond stage still runs).
    Stop,
}

/// One phase of event processing.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// The slot this stage occupies.
    fn stage(&self) -> Stage;

    /// Processes one event against a registry snapshot.
    async fn process(
        &self,
        ctx: &Arc<EventContext>,
        registry: &HandlerRegistry,
    ) -> Result<StageFlow, DispatchError>;
}

// =============================================================================
// Handler execution
// =============================================================================

/// Runs `handler` once, converting panics into handler errors.
pub async fn invoke_handler(handler: &HandlerDescriptor, call: HandlerCall) -> Result<(), HandlerError> {
    match AssertUnwindSafe((handler.handler)(call)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(HandlerError::Failed(format!("panic: {msg}")))
        }
    }
}

/// Runs every handler registered for `event_type` in registry order,
/// honouring the event's plugin allowlist and stop flag.
///
/// Handler failures are logged and do not interrupt the chain.
pub async fn run_hooks(
    ctx: &Arc<EventContext>,
    registry: &HandlerRegistry,
    event_type: EventType,
    request: Option<SharedRequest>,
) {
    let plugins_name = ctx.plugins_name();
    for handler in registry.get(event_type, true, plugins_name.as_deref()) {
        if ctx.is_stopped() {
            debug!(event_type = %event_type, "Event stopped, skipping remaining hooks");
            break;
        }
        let call = HandlerCall {
            ctx: Arc::clone(ctx),
            request: request.clone(),
            params: Vec::new(),
        };
        if let Err(e) = invoke_handler(&handler, call).await {
            warn!(handler = %handler.full_name, event_type = %event_type, error = %e, "Hook failed");
        }
    }
}

// =============================================================================
// Built-in stages
// =============================================================================

/// Runs the handlers activated by the wake stage.
#[derive(Debug, Default)]
pub struct ProcessStage;

#[async_trait]
impl PipelineStage for ProcessStage {
    fn stage(&self) -> Stage {
        Stage::Process
    }

    async fn process(
        &self,
        ctx: &Arc<EventContext>,
        _registry: &HandlerRegistry,
    ) -> Result<StageFlow, DispatchError> {
        for handler in ctx.activated_handlers() {
            if ctx.is_stopped() {
                break;
            }
            let call = HandlerCall {
                ctx: Arc::clone(ctx),
                request: None,
                params: ctx.params_for(&handler.full_name),
            };
            debug!(handler = %handler.full_name, "Running handler");
            if let Err(e) = invoke_handler(&handler, call).await {
                error!(handler = %handler.full_name, error = %e, "Handler failed");
            }
        }
        Ok(if ctx.is_stopped() {
            StageFlow::Stop
        } else {
            StageFlow::Continue
        })
    }
}

/// Runs every handler of one hook event type at a fixed stage.
#[derive(Debug)]
pub struct HookStage {
    stage: Stage,
    event_type: EventType,
}

impl HookStage {
    /// Creates a hook stage.
    pub fn new(stage: Stage, event_type: EventType) -> Self {
        Self { stage, event_type }
    }

    /// The result-decoration hook.
    pub fn result_decorate() -> Self {
        Self::new(Stage::ResultDecorate, EventType::OnDecoratingResult)
    }
}

#[async_trait]
impl PipelineStage for HookStage {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn process(
        &self,
        ctx: &Arc<EventContext>,
        registry: &HandlerRegistry,
    ) -> Result<StageFlow, DispatchError> {
        if ctx.result().is_some() {
            run_hooks(ctx, registry, self.event_type, None).await;
        }
        Ok(StageFlow::Continue)
    }
}

/// Sends the event result and then runs `on_after_message_sent` hooks.
#[derive(Debug, Default)]
pub struct RespondStage;

#[async_trait]
impl PipelineStage for RespondStage {
    fn stage(&self) -> Stage {
        Stage::Respond
    }

    async fn process(
        &self,
        ctx: &Arc<EventContext>,
        registry: &HandlerRegistry,
    ) -> Result<StageFlow, DispatchError> {
        let Some(result) = ctx.result() else {
            return Ok(StageFlow::Continue);
        };
        if result.chain.is_empty() {
            return Ok(StageFlow::Continue);
        }
        ctx.send(result.chain).await?;
        // Hooks see the event as delivered even if a handler stopped it earlier.
        ctx.continue_event();
        run_hooks(ctx, registry, EventType::OnAfterMessageSent, None).await;
        Ok(StageFlow::Continue)
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Ordered stages plus the registry they read.
pub struct Pipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
    registry: Arc<SharedRegistry>,
}

impl Pipeline {
    /// Creates an empty pipeline over `registry`.
    pub fn new(registry: Arc<SharedRegistry>) -> Self {
        Self {
            stages: Vec::new(),
            registry,
        }
    }

    /// The standard pipeline: wake, process, result decoration and respond.
    pub fn standard(
        registry: Arc<SharedRegistry>,
        config: Arc<WakeConfig>,
        sessions: Arc<dyn SessionPluginFilter>,
    ) -> Self {
        Self::new(registry)
            .with_stage(WakingCheckStage::new(config, sessions))
            .with_stage(ProcessStage)
            .with_stage(HookStage::result_decorate())
            .with_stage(RespondStage)
    }

    /// Inserts a stage at its slot; stages sharing a slot keep insertion order.
    pub fn with_stage(mut self, stage: impl PipelineStage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self.stages.sort_by_key(|s| s.stage());
        self
    }

    /// The stage slots in execution order.
    pub fn stages(&self) -> Vec<Stage> {
        self.stages.iter().map(|s| s.stage()).collect()
    }

    /// Processes one event through every stage.
    ///
    /// Once the event is stopped, only [`Stage::Respond`] stages still run so
    /// that a result set before the stop is delivered.
    pub async fn dispatch(&self, ctx: Arc<EventContext>) -> Result<(), DispatchError> {
        let registry = self.registry.snapshot();
        let span = span!(
            Level::DEBUG,
            "dispatch",
            origin = %ctx.origin(),
            sender = %ctx.sender_id(),
        );

        async {
            let mut halted = false;
            for stage in &self.stages {
                let slot = stage.stage();
                if (halted || ctx.is_stopped()) && slot != Stage::Respond {
                    continue;
                }
                match stage.process(&ctx, &registry).await? {
                    StageFlow::Continue => {}
                    StageFlow::Stop => {
                        debug!(stage = %slot, "Stage stopped the event");
                        halted = true;
                    }
                }
            }
            Ok::<(), DispatchError>(())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::context::EventResult;
    use crate::error::{HandlerResult, OutboundError};
    use crate::filter::{CommandFilter, ParamKind, ParamSpec};
    use crate::handler::into_handler;
    use crate::llm::ProviderRequest;
    use crate::outbound::Outbound;
    use crate::session::AllowAllSessions;
    use concord_core::{
        MessageChain, MessageEvent, MessageOrigin, MessageType, PlatformMeta, Sender,
    };

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Outbound for Recorder {
        async fn send(&self, _: &MessageOrigin, chain: MessageChain) -> Result<(), OutboundError> {
            self.sent.lock().push(chain.plain_text());
            Ok(())
        }
        async fn react(&self, _: &MessageOrigin, _: &str, _: &str) -> Result<(), OutboundError> {
            Ok(())
        }
        async fn request_llm(&self, _: ProviderRequest) -> Result<String, OutboundError> {
            Ok(String::new())
        }
    }

    fn event(text: &str) -> MessageEvent {
        MessageEvent::new(
            PlatformMeta {
                name: "onebot".into(),
                id: "qq".into(),
            },
            MessageType::GroupMessage,
            "room",
            "bot",
            Sender {
                user_id: "u".into(),
                nickname: None,
            },
            MessageChain::new().text(text),
        )
    }

    async fn echo(call: HandlerCall) -> HandlerResult {
        let word = call.param(0).map(ToString::to_string).unwrap_or_default();
        call.ctx.set_result(EventResult::text(format!("echo {word}")));
        call.ctx.stop_event();
        Ok(())
    }

    async fn decorate(call: HandlerCall) -> HandlerResult {
        call.ctx.result_chain().push(concord_core::MessageSegment::text("!"));
        Ok(())
    }

    async fn explode(_: HandlerCall) -> HandlerResult {
        panic!("kaboom")
    }

    fn pipeline(reg: HandlerRegistry) -> Pipeline {
        Pipeline::standard(
            Arc::new(SharedRegistry::new(reg)),
            Arc::new(WakeConfig::default()),
            Arc::new(AllowAllSessions),
        )
    }

    #[test]
    fn test_stages_are_ordered() {
        let p = Pipeline::new(Arc::new(SharedRegistry::default()))
            .with_stage(RespondStage)
            .with_stage(ProcessStage)
            .with_stage(HookStage::result_decorate());
        assert_eq!(
            p.stages(),
            vec![Stage::Process, Stage::ResultDecorate, Stage::Respond]
        );
    }

    #[tokio::test]
    async fn test_command_result_is_delivered_after_stop() {
        let mut reg = HandlerRegistry::new();
        reg.register(
            HandlerDescriptor::new(EventType::AdapterMessage, "p", "echo", into_handler(echo))
                .with_filter(CommandFilter::new("echo").param(ParamSpec::required("w", ParamKind::Str))),
        );
        let outbound = Arc::new(Recorder::default());
        let ctx = Arc::new(EventContext::new(event("/echo hi"), outbound.clone()));

        pipeline(reg).dispatch(ctx).await.unwrap();
        assert_eq!(*outbound.sent.lock(), vec!["echo hi".to_string()]);
    }

    #[tokio::test]
    async fn test_decorate_hook_runs_before_send() {
        let mut reg = HandlerRegistry::new();
        reg.register(
            HandlerDescriptor::new(EventType::AdapterMessage, "p", "echo", into_handler(|call: HandlerCall| async move {
                call.ctx.set_result(EventResult::text("hi"));
                Ok(())
            }))
            .with_filter(CommandFilter::new("hi")),
        );
        reg.register(HandlerDescriptor::new(
            EventType::OnDecoratingResult,
            "d",
            "bang",
            into_handler(decorate),
        ));
        let outbound = Arc::new(Recorder::default());
        let ctx = Arc::new(EventContext::new(event("/hi"), outbound.clone()));

        pipeline(reg).dispatch(ctx).await.unwrap();
        assert_eq!(*outbound.sent.lock(), vec!["hi!".to_string()]);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let mut reg = HandlerRegistry::new();
        reg.register(
            HandlerDescriptor::new(EventType::AdapterMessage, "p", "boom", into_handler(explode))
                .with_filter(CommandFilter::new("boom")),
        );
        let outbound = Arc::new(Recorder::default());
        let ctx = Arc::new(EventContext::new(event("/boom"), outbound.clone()));

        assert!(pipeline(reg).dispatch(ctx).await.is_ok());
        assert!(outbound.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unwoken_event_sends_nothing() {
        let outbound = Arc::new(Recorder::default());
        let ctx = Arc::new(EventContext::new(event("chatter"), outbound.clone()));
        pipeline(HandlerRegistry::new()).dispatch(ctx.clone()).await.unwrap();
        assert!(ctx.is_stopped());
        assert!(outbound.sent.lock().is_empty());
    }
}
