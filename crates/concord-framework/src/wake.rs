//! The wake & dispatch stage.
//!
//! [`WakingCheckStage`] decides whether the bot reacts to an inbound message
//! and which handlers run for it:
//!
//! 1. Self-sent messages are dropped when configured.
//! 2. Configured admins get the admin role.
//! 3. A wake prefix wakes the event and is stripped from the text, unless a
//!    group message opens by mentioning someone other than the bot.
//! 4. Otherwise a mention of the bot, a mention of everyone, or a reply to the
//!    bot wakes it; so does a private message when no prefix is required.
//! 5. Command handlers compete by longest literal match; the winner's
//!    remaining filters decide activation. Without an activated command,
//!    every other handler is evaluated independently.
//! 6. Session-level plugin switches prune the activated set, which is then
//!    attached to the event. An event that is still not woken is stopped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use concord_core::{EventType, MessageChain, MessageSegment, MessageType, Stage};

use crate::config::WakeConfig;
use crate::context::{EventContext, Role};
use crate::error::{DispatchError, FilterError};
use crate::filter::{CommandMatch, Filter, ParamValue, normalize_command_text};
use crate::handler::HandlerDescriptor;
use crate::pipeline::{PipelineStage, StageFlow};
use crate::registry::HandlerRegistry;
use crate::session::SessionPluginFilter;

/// Outcome of running a handler's non-command filters.
enum FilterOutcome {
    Passed,
    Rejected,
    PermissionSkipped,
}

/// Why evaluation of a handler must end the event.
enum Abort {
    Denied { sender_id: String, handler: String },
    Failed(DispatchError),
}

/// The first pipeline stage.
pub struct WakingCheckStage {
    config: Arc<WakeConfig>,
    sessions: Arc<dyn SessionPluginFilter>,
}

impl WakingCheckStage {
    /// Creates the stage.
    pub fn new(config: Arc<WakeConfig>, sessions: Arc<dyn SessionPluginFilter>) -> Self {
        Self { config, sessions }
    }

    /// Runs the wake decision for one event.
    pub async fn check(
        &self,
        ctx: &EventContext,
        registry: &HandlerRegistry,
    ) -> Result<StageFlow, DispatchError> {
        let cfg = &*self.config;
        let event = ctx.event();

        if cfg.ignore_bot_self_message && event.is_from_self() {
            ctx.stop_event();
            return Ok(StageFlow::Stop);
        }

        if cfg.is_admin(ctx.sender_id()) {
            ctx.set_role(Role::Admin);
        }

        self.resolve_wake(ctx);

        let plugins_name = cfg.plugin_allowlist();
        ctx.set_plugins_name(plugins_name.clone());

        let handlers = registry.get(EventType::AdapterMessage, true, plugins_name.as_deref());
        let (commands, others): (Vec<_>, Vec<_>) =
            handlers.into_iter().partition(|h| h.is_command());
        log_command_collisions(&commands);

        let mut activated = Vec::new();
        let mut params = HashMap::new();

        let outcome = self.activate(ctx, registry, &commands, &others, &mut activated, &mut params);
        if let Err(abort) = outcome {
            return self.abort(ctx, abort).await;
        }

        let activated = self
            .sessions
            .filter_by_session(&ctx.origin(), activated, registry)
            .await;
        params.retain(|name, _| activated.iter().any(|h| &h.full_name == name));
        ctx.set_activated(activated, params);

        if !ctx.is_wake() {
            ctx.stop_event();
            return Ok(StageFlow::Stop);
        }
        Ok(StageFlow::Continue)
    }

    fn resolve_wake(&self, ctx: &EventContext) {
        let cfg = &*self.config;
        let event = ctx.event();
        let text = ctx.message_str();

        // A group message opening with a mention of someone else is not
        // addressed to the bot even if the text carries a prefix.
        let mentions_other = event.message_type == MessageType::GroupMessage
            && matches!(
                event.leading_segment(),
                Some(MessageSegment::At { target, .. }) if *target != event.self_id
            );

        if !mentions_other {
            let prefix = cfg
                .wake_prefix
                .iter()
                .filter(|p| !p.is_empty())
                .find(|p| text.starts_with(p.as_str()));
            if let Some(prefix) = prefix {
                ctx.set_message_str(text[prefix.len()..].trim_start());
                ctx.mark_woken(true);
                return;
            }
        }

        let addressed = event.message.iter().any(|seg| match seg {
            MessageSegment::At { target, .. } => *target == event.self_id,
            MessageSegment::AtAll => !cfg.ignore_at_all,
            MessageSegment::Reply { sender_id, .. } => *sender_id == event.self_id,
            _ => false,
        });
        if addressed {
            ctx.mark_woken(true);
            return;
        }

        if event.is_private() && !cfg.friend_message_needs_wake_prefix {
            ctx.mark_woken(true);
        }
    }

    fn activate(
        &self,
        ctx: &EventContext,
        registry: &HandlerRegistry,
        commands: &[Arc<HandlerDescriptor>],
        others: &[Arc<HandlerDescriptor>],
        activated: &mut Vec<Arc<HandlerDescriptor>>,
        params: &mut HashMap<String, Vec<ParamValue>>,
    ) -> Result<(), Abort> {
        if ctx.is_at_or_wake_command() {
            if let Some((handler, values)) = self.resolve_command(ctx, registry, commands)? {
                params.insert(handler.full_name.clone(), values);
                activated.push(handler);
                ctx.mark_woken(false);
                return Ok(());
            }
        }

        for handler in others {
            if handler.filters.is_empty() {
                continue;
            }
            if let FilterOutcome::Passed = self.run_filters(ctx, registry, handler)? {
                activated.push(Arc::clone(handler));
                ctx.mark_woken(false);
            }
        }
        Ok(())
    }

    /// Longest-match command resolution.
    ///
    /// Candidates are ordered by matched length, longest first; the stable
    /// sort keeps registry order (priority, then insertion) among equals.
    fn resolve_command(
        &self,
        ctx: &EventContext,
        registry: &HandlerRegistry,
        commands: &[Arc<HandlerDescriptor>],
    ) -> Result<Option<(Arc<HandlerDescriptor>, Vec<ParamValue>)>, Abort> {
        let text = normalize_command_text(&ctx.message_str());
        if text.is_empty() {
            return Ok(None);
        }

        let mut candidates: Vec<(&Arc<HandlerDescriptor>, &Filter, CommandMatch)> = Vec::new();
        for handler in commands {
            let mut best: Option<(&Filter, CommandMatch)> = None;
            for filter in handler.filters.iter().filter(|f| f.is_command()) {
                let found = match filter {
                    Filter::Command(c) => c.longest_match(&text),
                    Filter::CommandGroup(g) => g.longest_match(&text),
                    _ => None,
                };
                let Some(found) = found else { continue };
                let pre = match filter {
                    Filter::Command(c) => c.pre_filters_pass(ctx, &self.config),
                    Filter::CommandGroup(g) => g.pre_filters_pass(ctx, &self.config),
                    _ => Ok(true),
                };
                if !pre.map_err(|e| self.filter_failure(registry, handler, e))? {
                    continue;
                }
                if best.as_ref().is_none_or(|(_, b)| found.len > b.len) {
                    best = Some((filter, found));
                }
            }
            if let Some((filter, found)) = best {
                candidates.push((handler, filter, found));
            }
        }
        candidates.sort_by(|a, b| b.2.len.cmp(&a.2.len));

        for (handler, filter, found) in candidates {
            let values = match filter {
                Filter::Command(c) => match c.parse_params(&found.rest) {
                    Ok(values) => values,
                    Err(e) => {
                        debug!(handler = %handler.full_name, error = %e, "Command arguments rejected");
                        continue;
                    }
                },
                _ => Vec::new(),
            };
            match self.run_filters(ctx, registry, handler)? {
                FilterOutcome::Passed => return Ok(Some((Arc::clone(handler), values))),
                FilterOutcome::PermissionSkipped => return Ok(None),
                FilterOutcome::Rejected => continue,
            }
        }
        Ok(None)
    }

    /// Runs the non-command filters of `handler`, permission filters last.
    fn run_filters(
        &self,
        ctx: &EventContext,
        registry: &HandlerRegistry,
        handler: &Arc<HandlerDescriptor>,
    ) -> Result<FilterOutcome, Abort> {
        let (permissions, rest): (Vec<&Filter>, Vec<&Filter>) = handler
            .filters
            .iter()
            .filter(|f| !f.is_command())
            .partition(|f| f.is_permission());

        for filter in rest {
            let passed = filter
                .matches(ctx, &self.config)
                .map_err(|e| self.filter_failure(registry, handler, e))?;
            if !passed {
                return Ok(FilterOutcome::Rejected);
            }
        }

        for filter in permissions {
            match filter.matches(ctx, &self.config) {
                Ok(true) => {}
                Ok(false) => return Ok(FilterOutcome::PermissionSkipped),
                Err(FilterError::PermissionDenied { sender_id }) => {
                    return Err(Abort::Denied {
                        sender_id,
                        handler: handler.full_name.clone(),
                    });
                }
                Err(e) => return Err(self.filter_failure(registry, handler, e)),
            }
        }
        Ok(FilterOutcome::Passed)
    }

    fn filter_failure(
        &self,
        registry: &HandlerRegistry,
        handler: &HandlerDescriptor,
        source: FilterError,
    ) -> Abort {
        if let FilterError::PermissionDenied { sender_id } = source {
            return Abort::Denied {
                sender_id,
                handler: handler.full_name.clone(),
            };
        }
        Abort::Failed(DispatchError::FilterEvaluation {
            plugin: registry.plugin_label(&handler.module_path).to_string(),
            handler: handler.full_name.clone(),
            source,
        })
    }

    async fn abort(&self, ctx: &EventContext, abort: Abort) -> Result<StageFlow, DispatchError> {
        ctx.stop_event();
        match abort {
            Abort::Denied { sender_id, handler } => {
                debug!(sender = %sender_id, handler = %handler, "Permission denied");
                if self.config.no_permission_reply {
                    let notice = format!(
                        "Permission denied: user {sender_id} is not allowed to use this command."
                    );
                    if let Err(e) = ctx.send(MessageChain::new().text(notice)).await {
                        warn!(error = %e, "Failed to deliver permission notice");
                    }
                }
                Ok(StageFlow::Stop)
            }
            Abort::Failed(err) => {
                error!(error = %err, "Filter evaluation failed, terminating event");
                if let DispatchError::FilterEvaluation { plugin, source, .. } = &err {
                    let notice = format!("Plugin {plugin}: {source}");
                    if let Err(e) = ctx.send(MessageChain::new().text(notice)).await {
                        warn!(error = %e, "Failed to deliver filter diagnostic");
                    }
                }
                Err(err)
            }
        }
    }
}

/// Logs command signatures claimed by more than one handler. Dispatch is
/// not affected; longest match and registry order still pick one winner.
fn log_command_collisions(commands: &[Arc<HandlerDescriptor>]) {
    let mut owners: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for handler in commands {
        if let Some(spec) = handler.command_spec() {
            for name in spec.all_names() {
                owners
                    .entry(name.to_string())
                    .or_default()
                    .push(&handler.full_name);
            }
        }
    }
    for (name, handlers) in owners.iter().filter(|(_, h)| h.len() > 1) {
        warn!(command = %name, handlers = ?handlers, "Command name registered by multiple handlers");
    }
}

#[async_trait]
impl PipelineStage for WakingCheckStage {
    fn stage(&self) -> Stage {
        Stage::Waking
    }

    async fn process(
        &self,
        ctx: &Arc<EventContext>,
        registry: &HandlerRegistry,
    ) -> Result<StageFlow, DispatchError> {
        self.check(ctx, registry).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::error::{HandlerResult, OutboundError};
    use crate::filter::{
        CommandFilter, CommandGroupFilter, CustomFilter, ParamKind, ParamSpec, PermissionFilter,
        RegexFilter,
    };
    use crate::handler::{HandlerCall, into_handler};
    use crate::llm::ProviderRequest;
    use crate::outbound::Outbound;
    use crate::session::{AllowAllSessions, StaticSessionFilter};
    use concord_core::{MessageEvent, MessageOrigin, PlatformMeta, Sender};

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

    async fn noop(_: HandlerCall) -> HandlerResult {
        Ok(())
    }

    fn command(module: &str, name: &str, filter: CommandFilter) -> HandlerDescriptor {
        HandlerDescriptor::new(EventType::AdapterMessage, module, name, into_handler(noop))
            .with_filter(filter)
    }

    fn event(message_type: MessageType, sender: &str, chain: MessageChain) -> MessageEvent {
        MessageEvent::new(
            PlatformMeta {
                name: "onebot".into(),
                id: "qq".into(),
            },
            message_type,
            "room",
            "bot",
            Sender {
                user_id: sender.into(),
                nickname: None,
            },
            chain,
        )
    }

    struct Harness {
        stage: WakingCheckStage,
        outbound: Arc<Recorder>,
    }

    impl Harness {
        fn new(config: WakeConfig) -> Self {
            Self {
                stage: WakingCheckStage::new(Arc::new(config), Arc::new(AllowAllSessions)),
                outbound: Arc::new(Recorder::default()),
            }
        }

        async fn run(
            &self,
            registry: &HandlerRegistry,
            event: MessageEvent,
        ) -> (EventContext, Result<StageFlow, DispatchError>) {
            let ctx = EventContext::new(event, self.outbound.clone());
            let flow = self.stage.check(&ctx, registry).await;
            (ctx, flow)
        }
    }

    fn activated(ctx: &EventContext) -> Vec<String> {
        ctx.activated_handlers()
            .iter()
            .map(|h| h.full_name.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_longest_match_ignores_registration_order() {
        let orders = [["a", "a b", "a b c"], ["a b c", "a", "a b"], ["a b", "a b c", "a"]];
        for order in orders {
            let mut reg = HandlerRegistry::new();
            for (i, name) in order.iter().enumerate() {
                reg.register(command(
                    "p",
                    &format!("h{i}"),
                    CommandFilter::new(*name).param(ParamSpec::optional(
                        "rest",
                        ParamKind::Greedy,
                        ParamValue::Str(String::new()),
                    )),
                ));
            }
            let h = Harness::new(WakeConfig::default());
            let (ctx, flow) = h
                .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("/a b c extra")))
                .await;
            assert!(matches!(flow, Ok(StageFlow::Continue)));
            let winner = ctx.activated_handlers();
            assert_eq!(winner.len(), 1);
            assert_eq!(winner[0].command_spec().unwrap().name, "a b c");
            assert_eq!(
                ctx.params_for(&winner[0].full_name),
                vec![ParamValue::Str("extra".into())]
            );
        }
    }

    #[tokio::test]
    async fn test_longest_match_without_params() {
        let orders = [["a", "a b", "a b c"], ["a b c", "a b", "a"]];
        for order in orders {
            let mut reg = HandlerRegistry::new();
            for (i, name) in order.iter().enumerate() {
                reg.register(command("p", &format!("h{i}"), CommandFilter::new(*name)));
            }
            let h = Harness::new(WakeConfig::default());
            let (ctx, flow) = h
                .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("/a b c extra")))
                .await;
            assert!(matches!(flow, Ok(StageFlow::Continue)));
            let winner = ctx.activated_handlers();
            assert_eq!(winner.len(), 1);
            assert_eq!(winner[0].command_spec().unwrap().name, "a b c");
            assert!(ctx.params_for(&winner[0].full_name).is_empty());
        }
    }

    #[tokio::test]
    async fn test_trailing_text_after_bare_command() {
        let mut reg = HandlerRegistry::new();
        reg.register(command("p", "ping", CommandFilter::new("ping")));
        reg.register(command("p", "echo", CommandFilter::new("echo").strict()));

        let h = Harness::new(WakeConfig::default());
        let (ctx, _) = h
            .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("/ping hello")))
            .await;
        assert_eq!(activated(&ctx), vec!["p_ping"]);

        let (ctx, _) = h
            .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("/echo hello")))
            .await;
        assert!(activated(&ctx).is_empty());
    }

    #[tokio::test]
    async fn test_handler_competes_with_its_longest_filter() {
        let mut reg = HandlerRegistry::new();
        // Registered first, so it would win an equal-length tie.
        reg.register(
            command("p", "short", CommandFilter::new("cfg"))
                .with_filter(CommandFilter::new("cfg llm set")),
        );
        reg.register(command("q", "mid", CommandFilter::new("cfg llm")));

        let h = Harness::new(WakeConfig::default());
        let (ctx, _) = h
            .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("/cfg llm set gpt")))
            .await;
        assert_eq!(activated(&ctx), vec!["p_short"]);

        let (ctx, _) = h
            .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("/cfg llm")))
            .await;
        assert_eq!(activated(&ctx), vec!["q_mid"]);
    }

    #[tokio::test]
    async fn test_equal_length_tie_goes_to_higher_priority() {
        let mut reg = HandlerRegistry::new();
        reg.register(command("low", "ping", CommandFilter::new("ping")));
        reg.register(command("high", "ping", CommandFilter::new("ping")).with_priority(3));
        reg.register(command("late", "ping", CommandFilter::new("ping")));

        let h = Harness::new(WakeConfig::default());
        let (ctx, _) = h
            .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("/ping")))
            .await;
        assert_eq!(activated(&ctx), vec!["high_ping"]);
    }

    #[tokio::test]
    async fn test_param_failure_eliminates_candidate() {
        let mut reg = HandlerRegistry::new();
        reg.register(command(
            "p",
            "ban_id",
            CommandFilter::new("ban").param(ParamSpec::required("user", ParamKind::Int)),
        ));
        reg.register(command(
            "p",
            "ban_name",
            CommandFilter::new("ban").param(ParamSpec::required("user", ParamKind::Str)),
        ));

        let h = Harness::new(WakeConfig::default());
        let (ctx, _) = h
            .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("/ban bob")))
            .await;
        assert_eq!(activated(&ctx), vec!["p_ban_name"]);
        assert_eq!(ctx.params_for("p_ban_name"), vec![ParamValue::Str("bob".into())]);
    }

    #[tokio::test]
    async fn test_private_wake_depends_on_friend_prefix_flag() {
        let reg = HandlerRegistry::new();

        let h = Harness::new(WakeConfig::default());
        let (ctx, flow) = h
            .run(&reg, event(MessageType::FriendMessage, "u", MessageChain::new().text("hello")))
            .await;
        assert!(ctx.is_wake());
        assert!(matches!(flow, Ok(StageFlow::Continue)));

        let h = Harness::new(WakeConfig {
            friend_message_needs_wake_prefix: true,
            ..Default::default()
        });
        let (ctx, flow) = h
            .run(&reg, event(MessageType::FriendMessage, "u", MessageChain::new().text("hello")))
            .await;
        assert!(!ctx.is_wake());
        assert!(ctx.is_stopped());
        assert!(matches!(flow, Ok(StageFlow::Stop)));
    }

    #[tokio::test]
    async fn test_self_message_ignored() {
        let h = Harness::new(WakeConfig::default());
        let (ctx, flow) = h
            .run(&HandlerRegistry::new(), event(MessageType::FriendMessage, "bot", MessageChain::new().text("/x")))
            .await;
        assert!(ctx.is_stopped());
        assert!(matches!(flow, Ok(StageFlow::Stop)));
    }

    #[tokio::test]
    async fn test_prefix_suppressed_by_leading_foreign_mention() {
        let mut reg = HandlerRegistry::new();
        reg.register(command("p", "help", CommandFilter::new("help")));
        let h = Harness::new(WakeConfig::default());

        let chain = MessageChain::new().at("someone").text("/help");
        let (ctx, _) = h.run(&reg, event(MessageType::GroupMessage, "u", chain)).await;
        assert!(!ctx.is_wake());
        assert!(activated(&ctx).is_empty());

        let chain = MessageChain::new().at("bot").text("/help");
        let (ctx, _) = h.run(&reg, event(MessageType::GroupMessage, "u", chain)).await;
        assert_eq!(activated(&ctx), vec!["p_help"]);
    }

    #[tokio::test]
    async fn test_mentions_and_replies_wake() {
        let reg = HandlerRegistry::new();
        let h = Harness::new(WakeConfig::default());

        let (ctx, _) = h
            .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().at("bot").text("hi")))
            .await;
        assert!(ctx.is_wake());

        let mut chain = MessageChain::new();
        chain.push(MessageSegment::AtAll);
        let (ctx, _) = h.run(&reg, event(MessageType::GroupMessage, "u", chain.clone())).await;
        assert!(ctx.is_wake());

        let h_ignore = Harness::new(WakeConfig {
            ignore_at_all: true,
            ..Default::default()
        });
        let (ctx, _) = h_ignore.run(&reg, event(MessageType::GroupMessage, "u", chain)).await;
        assert!(!ctx.is_wake());

        let mut chain = MessageChain::new();
        chain.push(MessageSegment::Reply {
            message_id: "1".into(),
            sender_id: "bot".into(),
        });
        chain.push(MessageSegment::text("what?"));
        let (ctx, _) = h.run(&reg, event(MessageType::GroupMessage, "u", chain)).await;
        assert!(ctx.is_wake());
    }

    #[tokio::test]
    async fn test_raising_permission_denial_sends_one_notice() {
        let mut reg = HandlerRegistry::new();
        reg.register(
            command("admin", "ban", CommandFilter::new("admin_ban").param(ParamSpec::required("user", ParamKind::Int)))
                .with_filter(PermissionFilter::admin().raising()),
        );
        reg.register(
            HandlerDescriptor::new(EventType::AdapterMessage, "log", "all", into_handler(noop))
                .with_filter(RegexFilter::new(".*").unwrap()),
        );

        let h = Harness::new(WakeConfig::default());
        let (ctx, flow) = h
            .run(&reg, event(MessageType::GroupMessage, "777", MessageChain::new().text("/admin_ban 123")))
            .await;
        assert!(ctx.is_stopped());
        assert!(matches!(flow, Ok(StageFlow::Stop)));
        let sent = h.outbound.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("777"));
    }

    #[tokio::test]
    async fn test_denial_without_reply_is_silent() {
        let mut reg = HandlerRegistry::new();
        reg.register(
            command("admin", "ban", CommandFilter::new("ban")).with_filter(PermissionFilter::admin().raising()),
        );
        let h = Harness::new(WakeConfig {
            no_permission_reply: false,
            ..Default::default()
        });
        let (ctx, _) = h
            .run(&reg, event(MessageType::GroupMessage, "777", MessageChain::new().text("/ban")))
            .await;
        assert!(ctx.is_stopped());
        assert!(h.outbound.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_silent_permission_skip_lets_others_wake() {
        let mut reg = HandlerRegistry::new();
        reg.register(
            command("admin", "ban", CommandFilter::new("ban")).with_filter(PermissionFilter::admin()),
        );
        reg.register(
            HandlerDescriptor::new(EventType::AdapterMessage, "log", "all", into_handler(noop))
                .with_filter(RegexFilter::new("ban").unwrap()),
        );

        let h = Harness::new(WakeConfig::default());
        let (ctx, flow) = h
            .run(&reg, event(MessageType::GroupMessage, "777", MessageChain::new().text("/ban")))
            .await;
        assert!(matches!(flow, Ok(StageFlow::Continue)));
        assert!(!ctx.is_stopped());
        assert_eq!(activated(&ctx), vec!["log_all"]);
        assert!(h.outbound.sent.lock().is_empty());

        let admin = Harness::new(WakeConfig {
            admins_id: vec!["777".into()],
            ..Default::default()
        });
        let (ctx, _) = admin
            .run(&reg, event(MessageType::GroupMessage, "777", MessageChain::new().text("/ban")))
            .await;
        assert_eq!(activated(&ctx), vec!["admin_ban"]);
    }

    #[tokio::test]
    async fn test_filter_error_terminates_with_diagnostic() {
        let mut reg = HandlerRegistry::new();
        reg.register_plugin(crate::plugin::PluginMetadata::new("flaky", "flaky"));
        reg.register(
            HandlerDescriptor::new(EventType::AdapterMessage, "flaky", "h", into_handler(noop))
                .with_filter(CustomFilter::new("explode", |_, _| Err(FilterError::evaluation("explode", "boom")))),
        );

        let h = Harness::new(WakeConfig::default());
        let (ctx, flow) = h
            .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("/anything")))
            .await;
        assert!(ctx.is_stopped());
        assert!(matches!(flow, Err(DispatchError::FilterEvaluation { ref plugin, .. }) if plugin == "flaky"));
        let sent = h.outbound.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("Plugin flaky:"));
    }

    #[tokio::test]
    async fn test_non_command_handlers_activate_together() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let mut reg = HandlerRegistry::new();
        reg.register(
            HandlerDescriptor::new(EventType::AdapterMessage, "a", "one", into_handler(noop))
                .with_filter(RegexFilter::new("weather").unwrap()),
        );
        reg.register(
            HandlerDescriptor::new(EventType::AdapterMessage, "b", "two", into_handler(noop))
                .with_filter(CustomFilter::new("count", move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                })),
        );
        reg.register(HandlerDescriptor::new(EventType::AdapterMessage, "c", "bare", into_handler(noop)));

        let h = Harness::new(WakeConfig::default());
        let (ctx, flow) = h
            .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("weather today")))
            .await;
        assert!(matches!(flow, Ok(StageFlow::Continue)));
        assert!(ctx.is_wake());
        assert_eq!(activated(&ctx), vec!["a_one", "b_two"]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_command_group_participates_in_longest_match() {
        let group = CommandGroupFilter::new("cfg");
        let mut reg = HandlerRegistry::new();
        reg.register(
            HandlerDescriptor::new(EventType::AdapterMessage, "p", "group", into_handler(noop))
                .with_filter(group.clone()),
        );
        reg.register(command("p", "set", CommandFilter::new("set").under(group).param(
            ParamSpec::required("value", ParamKind::Str),
        )));

        let h = Harness::new(WakeConfig::default());
        let (ctx, _) = h
            .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("/cfg set x")))
            .await;
        assert_eq!(activated(&ctx), vec!["p_set"]);

        let (ctx, _) = h
            .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("/cfg")))
            .await;
        assert_eq!(activated(&ctx), vec!["p_group"]);
    }

    #[tokio::test]
    async fn test_session_filter_prunes_activation() {
        let mut reg = HandlerRegistry::new();
        reg.register_plugin(crate::plugin::PluginMetadata::new("music", "music"));
        reg.register(command("music", "play", CommandFilter::new("play")));

        let sessions = Arc::new(StaticSessionFilter::new());
        sessions.disable(&MessageOrigin::new("qq", MessageType::GroupMessage, "room"), "music");
        let stage = WakingCheckStage::new(Arc::new(WakeConfig::default()), sessions);
        let ctx = EventContext::new(
            event(MessageType::GroupMessage, "u", MessageChain::new().text("/play")),
            Arc::new(Recorder::default()),
        );
        let flow = stage.check(&ctx, &reg).await;
        assert!(matches!(flow, Ok(StageFlow::Continue)));
        assert!(ctx.activated_handlers().is_empty());
    }

    #[tokio::test]
    async fn test_allowlist_excludes_unlisted_plugins() {
        let mut reg = HandlerRegistry::new();
        reg.register_plugin(crate::plugin::PluginMetadata::new("music", "music"));
        reg.register_plugin(crate::plugin::PluginMetadata::new("weather", "weather"));
        reg.register(command("music", "play", CommandFilter::new("play")));
        reg.register(command("weather", "now", CommandFilter::new("now")));

        let h = Harness::new(WakeConfig {
            plugin_set: vec!["weather".into()],
            ..Default::default()
        });
        let (ctx, _) = h
            .run(&reg, event(MessageType::GroupMessage, "u", MessageChain::new().text("/play")))
            .await;
        assert!(activated(&ctx).is_empty());
        assert_eq!(ctx.plugins_name(), Some(vec!["weather".to_string()]));
    }
}
