//! Stage-partitioned pipeline topology with a content-derived identity.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use concord_core::{EventType, MessageOrigin, Stage};
use concord_framework::{
    CommandSpec, HandlerDescriptor, HandlerRegistry, SessionPluginFilter, ToolDescriptor,
    ToolOrigin,
};

use crate::callgraph::PersonaMutation;
use crate::detectors::{Conflict, Detector, default_detectors, run_detectors};
use crate::effect::{Effect, HandlerEffects, Provenance, RiskSummary};
use crate::error::{AnalysisError, AnalysisResult};
use crate::preview::PreviewResult;
use crate::scanner::RiskScanner;

/// Default bound for the persona call-graph walk.
pub const DEFAULT_CALL_GRAPH_DEPTH: usize = 5;

// =============================================================================
// Document types
// =============================================================================

/// Which plugins a snapshot covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    /// Every activated plugin.
    Global,
    /// Plugins enabled in one session.
    Session {
        /// The session's UMO.
        origin: String,
    },
}

/// One handler's appearance in one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// The stage.
    pub stage: Stage,
    /// The handler's event type.
    pub event_type: EventType,
    /// Owning plugin's module id.
    pub plugin: String,
    /// Owning plugin's display label.
    pub plugin_name: String,
    /// Short handler name.
    pub handler_name: String,
    /// Globally unique handler name.
    pub full_name: String,
    /// Dispatch priority.
    pub priority: i64,
    /// Free-form description.
    pub desc: String,
    /// Command names, for command handlers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSpec>,
    /// Listed for visibility only; the handler runs in another stage.
    pub trigger_only: bool,
    /// Inferred effects.
    pub effects: Vec<Effect>,
    /// Where the effects came from.
    pub provenance: Provenance,
    /// Why scanning degraded, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
    /// Risk flags.
    pub risk: RiskSummary,
}

impl Participant {
    fn new(
        stage: Stage,
        handler: &HandlerDescriptor,
        plugin_name: &str,
        scanned: &HandlerEffects,
        trigger_only: bool,
    ) -> Self {
        let (effects, risk) = if trigger_only {
            (Vec::new(), RiskSummary::default())
        } else {
            (scanned.effects.clone(), scanned.risk)
        };
        Self {
            stage,
            event_type: handler.event_type,
            plugin: handler.module_path.clone(),
            plugin_name: plugin_name.to_string(),
            handler_name: handler.handler_name.clone(),
            full_name: handler.full_name.clone(),
            priority: handler.priority(),
            desc: handler.desc.clone(),
            command: handler.command_spec(),
            trigger_only,
            effects,
            provenance: scanned.provenance,
            degraded: scanned.degraded.clone(),
            risk,
        }
    }

    /// Normalized, order-independent descriptor used for identities.
    pub fn descriptor(&self) -> String {
        let mut effects: Vec<String> = self.effects.iter().map(Effect::key).collect();
        effects.sort();
        effects.dedup();
        let command = self
            .command
            .as_ref()
            .map(|c| {
                let mut names: Vec<&str> = c.all_names().collect();
                names.sort_unstable();
                names.join(",")
            })
            .unwrap_or_default();
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.stage,
            self.event_type,
            self.full_name,
            self.priority,
            self.trigger_only,
            command,
            effects.join(",")
        )
    }
}

/// Participants of one stage, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTopology {
    /// The stage.
    pub stage: Stage,
    /// Sorted by event type, priority descending, then full name.
    pub participants: Vec<Participant>,
}

/// Per-plugin summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    /// Plugin name.
    pub name: String,
    /// Module id.
    pub module_path: String,
    /// Display label.
    pub display_name: String,
    /// Built-in plugin.
    pub reserved: bool,
    /// In-scope handler count.
    pub handler_count: usize,
    /// Active tool count.
    pub tool_count: usize,
    /// Persona mutations made outside dispatch.
    pub persona_mutations: Vec<PersonaMutation>,
}

/// Aggregate counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    /// In-scope plugins.
    pub plugin_count: usize,
    /// In-scope handlers.
    pub handler_count: usize,
    /// Participants across all stages.
    pub participant_count: usize,
    /// Detected conflicts.
    pub conflict_count: usize,
    /// Participants with at least one risk flag.
    pub risk_count: usize,
    /// Participants whose effects are assumed rather than scanned.
    pub degraded_count: usize,
    /// Conflicts per type.
    pub conflicts_by_type: BTreeMap<String, usize>,
    /// Conflicts per severity.
    pub conflicts_by_severity: BTreeMap<String, usize>,
}

/// A generated topology and analysis document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Content-derived identity.
    pub id: String,
    /// Generation time.
    pub generated_at: DateTime<Utc>,
    /// Covered scope.
    pub scope: Scope,
    /// In-scope plugins, by module id.
    pub plugins: Vec<PluginSummary>,
    /// Stages in pipeline order; stages without participants are omitted.
    pub stages: Vec<StageTopology>,
    /// In-scope active tools.
    pub tools: Vec<ToolDescriptor>,
    /// Detected conflicts.
    pub conflicts: Vec<Conflict>,
    /// Optional dry-run preview attached by the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_injection_preview: Option<PreviewResult>,
    /// Aggregate counts.
    pub stats: SnapshotStats,
}

impl Snapshot {
    /// Every participant, stage by stage.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.stages.iter().flat_map(|s| s.participants.iter())
    }

    /// The participants of `stage`.
    pub fn stage(&self, stage: Stage) -> &[Participant] {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.participants.as_slice())
            .unwrap_or_default()
    }

    /// Conflicts of the given type name.
    pub fn conflicts_of(&self, conflict_type: &str) -> Vec<&Conflict> {
        self.conflicts
            .iter()
            .filter(|c| c.conflict_type.as_str() == conflict_type)
            .collect()
    }

    /// Attaches a preview (builder style).
    pub fn with_preview(mut self, preview: PreviewResult) -> Self {
        self.prompt_injection_preview = Some(preview);
        self
    }
}

/// Identity over participant descriptors, independent of their order.
pub fn snapshot_id<'a>(participants: impl IntoIterator<Item = &'a Participant>) -> String {
    let mut descriptors: Vec<String> = participants.into_iter().map(Participant::descriptor).collect();
    descriptors.sort();
    let mut hasher = Sha256::new();
    for descriptor in &descriptors {
        hasher.update(descriptor.as_bytes());
        hasher.update(b"\n");
    }
    let mut id = hex::encode(hasher.finalize());
    id.truncate(16);
    id
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles snapshots from a registry.
pub struct SnapshotBuilder {
    scanner: Arc<RiskScanner>,
    detectors: Vec<Arc<dyn Detector>>,
    sessions: Option<Arc<dyn SessionPluginFilter>>,
    plugin_allowlist: Option<Vec<String>>,
    call_graph_depth: usize,
}

impl SnapshotBuilder {
    /// Creates a builder running every built-in detector.
    pub fn new(scanner: Arc<RiskScanner>) -> Self {
        Self {
            scanner,
            detectors: default_detectors(),
            sessions: None,
            plugin_allowlist: None,
            call_graph_depth: DEFAULT_CALL_GRAPH_DEPTH,
        }
    }

    /// Sets the session filter used for session scopes.
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionPluginFilter>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Restricts snapshots to the listed plugins; `"*"` admits all.
    pub fn with_allowlist(mut self, allowlist: Option<Vec<String>>) -> Self {
        self.plugin_allowlist = allowlist;
        self
    }

    /// Sets the persona call-graph depth.
    pub fn with_call_graph_depth(mut self, depth: usize) -> Self {
        self.call_graph_depth = depth;
        self
    }

    /// Adds a detector after the built-in ones.
    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detectors.push(detector);
        self
    }

    /// Builds a snapshot of `registry` for `scope`.
    pub async fn build(&self, registry: &HandlerRegistry, scope: &Scope) -> AnalysisResult<Snapshot> {
        let session = match scope {
            Scope::Global => None,
            Scope::Session { origin } => {
                let origin: MessageOrigin = origin.parse()?;
                let sessions = self.sessions.as_ref().ok_or(AnalysisError::NoSessionFilter)?;
                Some((origin, sessions))
            }
        };

        let allowlist = self.plugin_allowlist.as_deref();
        let mut in_scope: Vec<Arc<HandlerDescriptor>> = Vec::new();
        for event_type in EventType::ALL {
            let mut handlers = registry.get(event_type, true, allowlist);
            if let Some((origin, sessions)) = &session {
                handlers = sessions.filter_by_session(origin, handlers, registry).await;
            }
            in_scope.extend(handlers);
        }

        let mut scanned: HashMap<&str, HandlerEffects> = HashMap::new();
        let mut by_stage: BTreeMap<Stage, Vec<Participant>> = BTreeMap::new();
        for handler in &in_scope {
            let effects = &*scanned
                .entry(handler.full_name.as_str())
                .or_insert_with(|| self.scanner.scan(handler));
            let plugin_name = registry.plugin_label(&handler.module_path);
            for &stage in handler.event_type.stages() {
                let trigger_only =
                    stage == Stage::Waking && handler.event_type == EventType::AdapterMessage;
                by_stage
                    .entry(stage)
                    .or_default()
                    .push(Participant::new(stage, handler, plugin_name, effects, trigger_only));
            }
        }

        let stages: Vec<StageTopology> = by_stage
            .into_iter()
            .map(|(stage, mut participants)| {
                participants.sort_by(|a, b| {
                    (a.event_type, Reverse(a.priority), &a.full_name)
                        .cmp(&(b.event_type, Reverse(b.priority), &b.full_name))
                });
                StageTopology { stage, participants }
            })
            .collect();

        let modules: BTreeSet<&str> = in_scope.iter().map(|h| h.module_path.as_str()).collect();
        let tools: Vec<ToolDescriptor> = registry
            .tools()
            .iter()
            .filter(|t| t.active)
            .filter(|t| matches!(t.origin, ToolOrigin::Mcp { .. }) || modules.contains(t.owner.as_str()))
            .cloned()
            .collect();
        let plugins = self.summarize_plugins(registry, &in_scope, &modules, &tools);

        let participants: Vec<Participant> =
            stages.iter().flat_map(|s| s.participants.iter().cloned()).collect();
        let conflicts = run_detectors(&self.detectors, &participants, &tools);
        let stats = compute_stats(&plugins, in_scope.len(), &participants, &conflicts);
        let id = snapshot_id(&participants);

        info!(
            snapshot = %id,
            participants = stats.participant_count,
            conflicts = stats.conflict_count,
            "Built pipeline snapshot"
        );

        Ok(Snapshot {
            id,
            generated_at: Utc::now(),
            scope: scope.clone(),
            plugins,
            stages,
            tools,
            conflicts,
            prompt_injection_preview: None,
            stats,
        })
    }

    fn summarize_plugins(
        &self,
        registry: &HandlerRegistry,
        in_scope: &[Arc<HandlerDescriptor>],
        modules: &BTreeSet<&str>,
        tools: &[ToolDescriptor],
    ) -> Vec<PluginSummary> {
        modules
            .iter()
            .map(|&module| {
                let meta = registry.plugin(module);
                let mut persona_mutations = Vec::new();
                let mut seen_origins = Vec::new();
                for handler in in_scope.iter().filter(|h| h.module_path == module) {
                    let Some(source) = &handler.source else { continue };
                    if seen_origins.contains(&&source.origin) {
                        continue;
                    }
                    seen_origins.push(&source.origin);
                    match self.scanner.scan_persona(source, self.call_graph_depth) {
                        Ok(found) => persona_mutations.extend(found),
                        Err(err) => debug!(plugin = %module, error = %err, "Persona walk skipped"),
                    }
                }
                PluginSummary {
                    name: meta.map_or_else(|| module.to_string(), |m| m.name.clone()),
                    module_path: module.to_string(),
                    display_name: registry.plugin_label(module).to_string(),
                    reserved: meta.is_some_and(|m| m.reserved),
                    handler_count: in_scope.iter().filter(|h| h.module_path == module).count(),
                    tool_count: tools.iter().filter(|t| t.owner == module).count(),
                    persona_mutations,
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for SnapshotBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotBuilder")
            .field("detectors", &self.detectors.iter().map(|d| d.name()).collect::<Vec<_>>())
            .field("plugin_allowlist", &self.plugin_allowlist)
            .field("call_graph_depth", &self.call_graph_depth)
            .finish_non_exhaustive()
    }
}

fn compute_stats(
    plugins: &[PluginSummary],
    handler_count: usize,
    participants: &[Participant],
    conflicts: &[Conflict],
) -> SnapshotStats {
    let mut stats = SnapshotStats {
        plugin_count: plugins.len(),
        handler_count,
        participant_count: participants.len(),
        conflict_count: conflicts.len(),
        risk_count: participants.iter().filter(|p| p.risk.any()).count(),
        degraded_count: participants
            .iter()
            .filter(|p| !p.trigger_only && p.provenance != Provenance::Source)
            .count(),
        ..SnapshotStats::default()
    };
    for conflict in conflicts {
        *stats
            .conflicts_by_type
            .entry(conflict.conflict_type.as_str().to_string())
            .or_default() += 1;
        *stats
            .conflicts_by_severity
            .entry(conflict.severity.as_str().to_string())
            .or_default() += 1;
    }
    stats
}
