//! The application root: configuration, the shared registry, plugin
//! lifecycle, live dispatch and the diagnostic entry points.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use concord_analysis::{
    DryRunEngine, EffectManifest, PreviewRequest, PreviewResult, RiskScanner, Scope, Snapshot,
    SnapshotBuilder,
};
use concord_core::MessageEvent;
use concord_framework::{
    AllowAllSessions, EventContext, HandlerDescriptor, HandlerRegistry, Outbound, Pipeline,
    PluginMetadata, SessionPluginFilter, SharedRegistry, ToolDescriptor, ToolOrigin, WakeConfig,
};

use crate::config::{ConcordConfig, ConfigLoader};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging::{self, LoggingError};

// =============================================================================
// PluginUnit
// =============================================================================

/// Everything one plugin contributes, loaded and unloaded as a whole.
pub struct PluginUnit {
    /// Plugin metadata; `module_path` is the plugin id.
    pub metadata: PluginMetadata,
    /// Handlers, each owned by `metadata.module_path`.
    pub handlers: Vec<HandlerDescriptor>,
    /// Local function tools, each owned by `metadata.module_path`.
    pub tools: Vec<ToolDescriptor>,
    /// Declared effects for handlers whose source cannot be scanned.
    pub manifest: Option<EffectManifest>,
}

impl PluginUnit {
    /// Creates an empty unit.
    pub fn new(metadata: PluginMetadata) -> Self {
        Self {
            metadata,
            handlers: Vec::new(),
            tools: Vec::new(),
            manifest: None,
        }
    }

    /// The plugin id.
    pub fn id(&self) -> &str {
        &self.metadata.module_path
    }

    /// Adds a handler (builder style).
    pub fn handler(mut self, handler: HandlerDescriptor) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Adds a local tool named `name` (builder style).
    pub fn tool(mut self, name: impl Into<String>) -> Self {
        let tool = ToolDescriptor::local(name, self.metadata.module_path.clone());
        self.tools.push(tool);
        self
    }

    /// Attaches an effect manifest (builder style).
    pub fn manifest(mut self, manifest: EffectManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    fn check_ownership(&self) -> RuntimeResult<()> {
        let id = self.id();
        let foreign = |item: &str, owner: &str| RuntimeError::ForeignOwner {
            plugin: id.to_string(),
            item: item.to_string(),
            owner: owner.to_string(),
        };
        if let Some(h) = self.handlers.iter().find(|h| h.module_path != id) {
            return Err(foreign(&h.full_name, &h.module_path));
        }
        if let Some(t) = self
            .tools
            .iter()
            .find(|t| t.owner != id || t.origin != ToolOrigin::Local)
        {
            return Err(foreign(&t.name, &t.owner));
        }
        Ok(())
    }
}

impl fmt::Debug for PluginUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginUnit")
            .field("id", &self.metadata.module_path)
            .field("handlers", &self.handlers.len())
            .field("tools", &self.tools.len())
            .field("manifest", &self.manifest.is_some())
            .finish()
    }
}

/// Moves `unit` into `registry`, returning the number of handlers added.
fn install(registry: &mut HandlerRegistry, unit: PluginUnit, skip_builtin_commands: bool) -> usize {
    let PluginUnit {
        metadata,
        handlers,
        tools,
        ..
    } = unit;
    let skip_commands = skip_builtin_commands && metadata.reserved;
    registry.register_plugin(metadata);

    let mut added = 0;
    for handler in handlers {
        if skip_commands && handler.is_command() {
            debug!(handler = %handler.full_name, "Built-in commands disabled, skipping");
            continue;
        }
        registry.register(handler);
        added += 1;
    }
    for tool in tools {
        registry.register_tool(tool);
    }
    added
}

// =============================================================================
// ConcordContext
// =============================================================================

/// The application root shared by the live and diagnostic paths.
///
/// Plugin load, unload and reload go through the registry's exclusive
/// writer section; dispatch, snapshots and previews each work on one
/// consistent registry snapshot.
pub struct ConcordContext {
    config: ConcordConfig,
    wake: Arc<WakeConfig>,
    registry: Arc<SharedRegistry>,
    sessions: Arc<dyn SessionPluginFilter>,
    scanner: Arc<RiskScanner>,
    pipeline: Pipeline,
}

impl ConcordContext {
    /// Loads configuration from the default locations.
    pub fn new() -> RuntimeResult<Self> {
        Self::builder().build()
    }

    /// Returns a builder for custom configuration sources.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Creates a context from an already-loaded configuration, initializing
    /// logging from its `logging` section.
    pub fn from_config(config: ConcordConfig) -> Self {
        Self::with_sessions(config, Arc::new(AllowAllSessions))
    }

    /// Like [`from_config`](Self::from_config) with a session filter.
    pub fn with_sessions(config: ConcordConfig, sessions: Arc<dyn SessionPluginFilter>) -> Self {
        match logging::init_from_config(&config.logging) {
            Ok(()) | Err(LoggingError::AlreadyInstalled(_)) => {}
            Err(e) => warn!(error = %e, "Logging not initialized"),
        }

        let wake = Arc::new(config.wake.clone());
        let registry = Arc::new(SharedRegistry::default());
        let pipeline = Pipeline::standard(
            Arc::clone(&registry),
            Arc::clone(&wake),
            Arc::clone(&sessions),
        );

        info!(
            wake_prefixes = wake.wake_prefix.len(),
            call_graph_depth = config.analysis.call_graph_depth,
            "Concord context created"
        );

        Self {
            config,
            wake,
            registry,
            sessions,
            scanner: Arc::new(RiskScanner::new()),
            pipeline,
        }
    }

    /// The loaded configuration.
    pub fn config(&self) -> &ConcordConfig {
        &self.config
    }

    /// The current registry snapshot.
    pub fn registry(&self) -> Arc<HandlerRegistry> {
        self.registry.snapshot()
    }

    /// The shared registry, for embedding in custom pipelines.
    pub fn shared_registry(&self) -> &Arc<SharedRegistry> {
        &self.registry
    }

    /// The scanner shared by snapshots and previews.
    pub fn scanner(&self) -> &Arc<RiskScanner> {
        &self.scanner
    }

    /// The live pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    // =========================================================================
    // Plugin lifecycle
    // =========================================================================

    /// Loads a plugin, returning the number of handlers registered.
    pub async fn load_plugin(&self, unit: PluginUnit) -> RuntimeResult<usize> {
        unit.check_ownership()?;
        let id = unit.id().to_string();
        let manifest = unit.manifest.clone();
        let skip = self.wake.disable_builtin_commands;

        let added = self
            .registry
            .update(|registry| {
                if registry.plugin(&id).is_some() {
                    return Err(RuntimeError::PluginExists(id.clone()));
                }
                Ok(install(registry, unit, skip))
            })
            .await?;

        if let Some(manifest) = manifest {
            self.scanner.add_manifest(manifest);
        }
        info!(plugin = %id, handlers = added, "Plugin loaded");
        Ok(added)
    }

    /// Unloads a plugin with its handlers and tools, returning the number of
    /// handlers removed.
    pub async fn unload_plugin(&self, id: &str) -> RuntimeResult<usize> {
        let removed = self
            .registry
            .update(|registry| {
                if registry.plugin(id).is_none() {
                    return Err(RuntimeError::PluginNotFound(id.to_string()));
                }
                Ok(registry.remove_plugin(id))
            })
            .await?;

        self.scanner.remove_manifest(id);
        self.scanner.invalidate();
        info!(plugin = %id, handlers = removed, "Plugin unloaded");
        Ok(removed)
    }

    /// Replaces plugin `id` with a freshly loaded `unit` in one exclusive
    /// section, so dispatch sees either the old plugin or the new one.
    pub async fn reload_plugin(&self, id: &str, unit: PluginUnit) -> RuntimeResult<usize> {
        unit.check_ownership()?;
        let new_id = unit.id().to_string();
        let manifest = unit.manifest.clone();
        let skip = self.wake.disable_builtin_commands;

        let added = self
            .registry
            .update(|registry| {
                if registry.plugin(id).is_none() {
                    return Err(RuntimeError::PluginNotFound(id.to_string()));
                }
                if new_id != id && registry.plugin(&new_id).is_some() {
                    return Err(RuntimeError::PluginExists(new_id.clone()));
                }
                let removed = registry.remove_plugin(id);
                debug!(plugin = %id, handlers = removed, "Unloaded for reload");
                Ok(install(registry, unit, skip))
            })
            .await?;

        self.scanner.remove_manifest(id);
        if let Some(manifest) = manifest {
            self.scanner.add_manifest(manifest);
        }
        self.scanner.invalidate();
        info!(plugin = %new_id, handlers = added, "Plugin reloaded");
        Ok(added)
    }

    /// Registers a tool hosted outside any plugin, e.g. by an MCP server.
    pub async fn add_tool(&self, tool: ToolDescriptor) {
        if tool.origin == ToolOrigin::Local {
            warn!(tool = %tool.name, owner = %tool.owner, "Local tool added outside a plugin unit");
        }
        self.registry
            .update(|registry| registry.register_tool(tool))
            .await;
    }

    // =========================================================================
    // Live path
    // =========================================================================

    /// Runs one inbound event through the pipeline and returns its context.
    pub async fn dispatch(
        &self,
        event: MessageEvent,
        outbound: Arc<dyn Outbound>,
    ) -> RuntimeResult<Arc<EventContext>> {
        let ctx = Arc::new(EventContext::new(event, outbound));
        self.pipeline.dispatch(Arc::clone(&ctx)).await?;
        Ok(ctx)
    }

    // =========================================================================
    // Diagnostic path
    // =========================================================================

    fn snapshot_builder(&self) -> SnapshotBuilder {
        SnapshotBuilder::new(Arc::clone(&self.scanner))
            .with_sessions(Arc::clone(&self.sessions))
            .with_allowlist(self.wake.plugin_allowlist())
            .with_call_graph_depth(self.config.analysis.call_graph_depth)
    }

    fn dry_run_engine(&self) -> DryRunEngine {
        DryRunEngine::new(self.config.preview.clone(), Arc::clone(&self.wake))
            .with_sessions(Arc::clone(&self.sessions))
            .with_scanner(
                Arc::clone(&self.scanner),
                self.config.analysis.call_graph_depth,
            )
    }

    /// Builds the pipeline snapshot for `scope`.
    pub async fn snapshot(&self, scope: &Scope) -> RuntimeResult<Snapshot> {
        let registry = self.registry.snapshot();
        Ok(self.snapshot_builder().build(&registry, scope).await?)
    }

    /// Dry-runs the `on_llm_request` chain for `request`.
    pub async fn preview(&self, request: &PreviewRequest) -> RuntimeResult<PreviewResult> {
        let registry = self.registry.snapshot();
        Ok(self.dry_run_engine().preview(&registry, request).await?)
    }

    /// Builds the snapshot for the request's session and attaches a dry run
    /// of the same registry state.
    pub async fn snapshot_with_preview(&self, request: &PreviewRequest) -> RuntimeResult<Snapshot> {
        let registry = self.registry.snapshot();
        let scope = Scope::Session {
            origin: request.origin.clone(),
        };
        let snapshot = self.snapshot_builder().build(&registry, &scope).await?;
        let preview = self.dry_run_engine().preview(&registry, request).await?;
        Ok(snapshot.with_preview(preview))
    }
}

impl fmt::Debug for ConcordContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcordContext")
            .field("config", &self.config)
            .field("handlers", &self.registry.snapshot().len())
            .field("stages", &self.pipeline.stages())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// ContextBuilder
// =============================================================================

/// Builder for creating a [`ConcordContext`] with custom configuration.
///
/// # Example
///
/// ```rust,ignore
/// let ctx = ConcordContext::builder()
///     .config_file("config/concord.production.toml")
///     .profile("production")
///     .build()?;
/// ```
pub struct ContextBuilder {
    config_loader: ConfigLoader,
    sessions: Option<Arc<dyn SessionPluginFilter>>,
}

impl ContextBuilder {
    /// Creates a new context builder.
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new(),
            sessions: None,
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g., "development", "production").
    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    /// Disables loading environment variables.
    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Starts from `config` instead of the built-in defaults.
    pub fn merge(mut self, config: ConcordConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Sets one dotted configuration key above files and environment.
    pub fn set<T: serde::Serialize>(mut self, key: &str, value: T) -> Self {
        self.config_loader = self.config_loader.set(key, value);
        self
    }

    /// Uses `sessions` for per-session plugin enablement.
    pub fn sessions(mut self, sessions: Arc<dyn SessionPluginFilter>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Loads the configuration and builds the context.
    pub fn build(self) -> RuntimeResult<ConcordContext> {
        let config = self.config_loader.load()?;
        let sessions = self.sessions.unwrap_or_else(|| Arc::new(AllowAllSessions));
        Ok(ConcordContext::with_sessions(config, sessions))
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use super::*;
    use async_trait::async_trait;
    use concord_analysis::{EffectOperation, EffectTarget, Provenance};
    use concord_core::{
        EventType, MessageChain, MessageOrigin, MessageType, PlatformMeta, Sender,
    };
    use concord_framework::{
        CommandFilter, EventResult, HandlerCall, HandlerResult, OutboundError, ProviderRequest,
        StaticSessionFilter, into_handler,
    };
    use parking_lot::Mutex;

    const ORIGIN: &str = "qq:GroupMessage:room";

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
        .with_group("room")
    }

    async fn pong(call: HandlerCall) -> HandlerResult {
        call.ctx.set_result(EventResult::text("pong"));
        Ok(())
    }

    async fn pong_v2(call: HandlerCall) -> HandlerResult {
        call.ctx.set_result(EventResult::text("pong v2"));
        Ok(())
    }

    async fn add_memory(call: HandlerCall) -> HandlerResult {
        if let Some(req) = &call.request {
            req.lock().system_prompt.push_str("[memory]");
        }
        Ok(())
    }

    fn ping_plugin<F, Fut>(module: &str, handler: F) -> PluginUnit
    where
        F: Fn(HandlerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        PluginUnit::new(PluginMetadata::new("ping", module)).handler(
            HandlerDescriptor::new(EventType::AdapterMessage, module, "ping", into_handler(handler))
                .with_filter(CommandFilter::new("ping")),
        )
    }

    fn context() -> ConcordContext {
        ConcordContext::from_config(ConcordConfig::default())
    }

    #[tokio::test]
    async fn test_load_dispatch_and_unload() {
        let ctx = context();
        assert_eq!(ctx.load_plugin(ping_plugin("plugins.ping", pong)).await.unwrap(), 1);

        let outbound = Arc::new(Recorder::default());
        ctx.dispatch(event("/ping"), outbound.clone()).await.unwrap();
        assert_eq!(*outbound.sent.lock(), vec!["pong".to_string()]);

        assert!(matches!(
            ctx.load_plugin(ping_plugin("plugins.ping", pong)).await,
            Err(RuntimeError::PluginExists(_))
        ));

        assert_eq!(ctx.unload_plugin("plugins.ping").await.unwrap(), 1);
        assert!(ctx.registry().is_empty());
        assert!(matches!(
            ctx.unload_plugin("plugins.ping").await,
            Err(RuntimeError::PluginNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_swaps_handlers_atomically() {
        let ctx = context();
        ctx.load_plugin(ping_plugin("plugins.ping", pong).tool("lookup"))
            .await
            .unwrap();
        let before = ctx.registry();

        ctx.reload_plugin("plugins.ping", ping_plugin("plugins.ping", pong_v2))
            .await
            .unwrap();

        // Earlier snapshots are unaffected by the writer.
        assert_eq!(before.tools().len(), 1);
        assert!(ctx.registry().tools().is_empty());
        assert_eq!(ctx.registry().len(), 1);

        let outbound = Arc::new(Recorder::default());
        ctx.dispatch(event("/ping"), outbound.clone()).await.unwrap();
        assert_eq!(*outbound.sent.lock(), vec!["pong v2".to_string()]);
    }

    #[tokio::test]
    async fn test_foreign_handlers_are_rejected() {
        let ctx = context();
        let unit = PluginUnit::new(PluginMetadata::new("a", "plugins.a")).handler(
            HandlerDescriptor::new(EventType::AdapterMessage, "plugins.b", "x", into_handler(pong)),
        );

        assert!(matches!(
            ctx.load_plugin(unit).await,
            Err(RuntimeError::ForeignOwner { .. })
        ));
        assert!(ctx.registry().plugins().is_empty());
    }

    #[tokio::test]
    async fn test_builtin_commands_can_be_disabled() {
        let mut config = ConcordConfig::default();
        config.wake.disable_builtin_commands = true;
        let ctx = ConcordContext::from_config(config);

        let builtin = PluginUnit::new(PluginMetadata::new("builtin", "builtin.commands").reserved())
            .handler(
                HandlerDescriptor::new(EventType::AdapterMessage, "builtin.commands", "help", into_handler(pong))
                    .with_filter(CommandFilter::new("help")),
            )
            .handler(HandlerDescriptor::new(
                EventType::OnLlmRequest,
                "builtin.commands",
                "inject",
                into_handler(add_memory),
            ));

        assert_eq!(ctx.load_plugin(builtin).await.unwrap(), 1);
        assert!(ctx.registry().lookup("builtin.commands_help").is_none());
    }

    #[tokio::test]
    async fn test_manifest_follows_plugin_lifecycle() {
        let ctx = context();
        let unit = PluginUnit::new(PluginMetadata::new("memory", "plugins.memory"))
            .handler(HandlerDescriptor::new(
                EventType::OnLlmRequest,
                "plugins.memory",
                "add_memory",
                into_handler(add_memory),
            ))
            .manifest(EffectManifest::new("plugins.memory").declare(
                "add_memory",
                EffectTarget::SystemPrompt,
                EffectOperation::Append,
            ));
        ctx.load_plugin(unit).await.unwrap();

        let handler = Arc::clone(&ctx.registry().handlers()[0]);
        assert_eq!(ctx.scanner().scan(&handler).provenance, Provenance::Manifest);

        ctx.unload_plugin("plugins.memory").await.unwrap();
        assert_eq!(ctx.scanner().scan(&handler).provenance, Provenance::Fallback);
    }

    #[tokio::test]
    async fn test_snapshot_and_preview_share_registry_state() {
        let sessions = Arc::new(StaticSessionFilter::new());
        let ctx = ConcordContext::with_sessions(ConcordConfig::default(), sessions.clone());
        ctx.load_plugin(ping_plugin("plugins.a", pong)).await.unwrap();
        ctx.load_plugin(ping_plugin("plugins.b", pong)).await.unwrap();
        ctx.load_plugin(
            PluginUnit::new(PluginMetadata::new("memory", "plugins.memory")).handler(
                HandlerDescriptor::new(EventType::OnLlmRequest, "plugins.memory", "add_memory", into_handler(add_memory)),
            ),
        )
        .await
        .unwrap();

        let global = ctx.snapshot(&Scope::Global).await.unwrap();
        assert_eq!(global.conflicts_of("command_name_conflict").len(), 1);

        let origin: MessageOrigin = ORIGIN.parse().unwrap();
        sessions.disable(&origin, "ping");
        let request = PreviewRequest::new(ORIGIN, "hello");
        let scoped = ctx.snapshot_with_preview(&request).await.unwrap();
        assert!(scoped.conflicts_of("command_name_conflict").is_empty());

        let preview = scoped.prompt_injection_preview.as_ref().unwrap();
        assert_eq!(preview.system_prompt, "[memory]");
        let direct = ctx.preview(&request).await.unwrap();
        assert_eq!(direct.attributed_segments, preview.attributed_segments);
    }
}
