//! Conflict detectors over snapshot participants.
//!
//! Detectors are pure: they read participants and tools and return
//! conflicts, iterating in a fixed order so the same input always yields the
//! same output, ids included.

mod commands;
mod mutation;
mod ordering;

pub use commands::{CommandConflictDetector, ToolNameDetector};
pub use mutation::{PromptOverwriteDetector, ResultChainMutationDetector};
pub use ordering::{DuplicateSendDetector, PriorityTieDetector, StopInterceptionDetector};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use concord_core::{EventType, Stage};
use concord_framework::ToolDescriptor;

use crate::snapshot::Participant;

// =============================================================================
// Conflict model
// =============================================================================

/// Kind of conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConflictType {
    /// Handlers share a canonical command name.
    #[serde(rename = "command_name_conflict")]
    CommandName,
    /// A name is an alias of at least one of the claiming handlers.
    #[serde(rename = "command_alias_conflict")]
    CommandAlias,
    /// Active tools share a name.
    #[serde(rename = "tool_name_conflict")]
    ToolName,
    /// Equal priorities make the order of risky handlers arbitrary.
    #[serde(rename = "priority_tie_conflict")]
    PriorityTie,
    /// One handler sends directly and also sets the result.
    #[serde(rename = "duplicate_send_conflict")]
    DuplicateSend,
    /// Competing writes to the user prompt.
    #[serde(rename = "prompt_overwrite_conflict")]
    PromptOverwrite,
    /// Competing writes to the system prompt.
    #[serde(rename = "system_prompt_overwrite_conflict")]
    SystemPromptOverwrite,
    /// A handler may stop the event before later handlers run.
    #[serde(rename = "stop_interception_conflict")]
    StopInterception,
    /// Competing edits of the result chain.
    #[serde(rename = "result_chain_mutation_risk")]
    ResultChainMutation,
}

impl ConflictType {
    /// The serialized name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommandName => "command_name_conflict",
            Self::CommandAlias => "command_alias_conflict",
            Self::ToolName => "tool_name_conflict",
            Self::PriorityTie => "priority_tie_conflict",
            Self::DuplicateSend => "duplicate_send_conflict",
            Self::PromptOverwrite => "prompt_overwrite_conflict",
            Self::SystemPromptOverwrite => "system_prompt_overwrite_conflict",
            Self::StopInterception => "stop_interception_conflict",
            Self::ResultChainMutation => "result_chain_mutation_risk",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How serious a conflict is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Likely unintended, but the pipeline still works.
    Warn,
    /// Earlier work is certainly lost.
    Error,
}

impl Severity {
    /// The serialized name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// A handler or tool involved in a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Involved {
    /// Owning plugin's module id, or the MCP server.
    pub plugin: String,
    /// Handler full name or tool name.
    pub name: String,
    /// Stage, for participants.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Event type, for participants.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    /// Priority, for participants.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

impl Involved {
    /// A participant.
    pub fn participant(p: &Participant) -> Self {
        Self {
            plugin: p.plugin.clone(),
            name: p.full_name.clone(),
            stage: Some(p.stage),
            event_type: Some(p.event_type),
            priority: Some(p.priority),
        }
    }

    /// A handler, independent of stage.
    pub fn handler(p: &Participant) -> Self {
        Self {
            stage: None,
            ..Self::participant(p)
        }
    }

    /// A tool.
    pub fn tool(t: &ToolDescriptor) -> Self {
        Self {
            plugin: t.owner.clone(),
            name: t.name.clone(),
            stage: None,
            event_type: None,
            priority: None,
        }
    }

    fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.plugin,
            self.name,
            self.stage.map(|s| s.as_str()).unwrap_or("-")
        )
    }
}

/// A detected risk of unintended plugin interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Content-derived id.
    pub id: String,
    /// Kind.
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    /// Severity.
    pub severity: Severity,
    /// One-line summary.
    pub title: String,
    /// Explanation.
    pub description: String,
    /// Every involved handler or tool.
    pub involved: Vec<Involved>,
    /// How to resolve it.
    pub suggestion: String,
    /// Related stages or names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

impl Conflict {
    /// Creates a conflict; the id hashes the type, title and involved set.
    pub fn new(
        conflict_type: ConflictType,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
        involved: Vec<Involved>,
        suggestion: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let keys: BTreeSet<String> = involved.iter().map(Involved::key).collect();
        let mut hasher = Sha256::new();
        hasher.update(conflict_type.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(title.as_bytes());
        for key in &keys {
            hasher.update(b"\n");
            hasher.update(key.as_bytes());
        }
        let mut id = hex::encode(hasher.finalize());
        id.truncate(12);

        Self {
            id,
            conflict_type,
            severity,
            title,
            description: description.into(),
            involved,
            suggestion: suggestion.into(),
            references: Vec::new(),
        }
    }

    /// Adds references (builder style).
    pub fn with_references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }
}

// =============================================================================
// Detector trait
// =============================================================================

/// What detectors read.
#[derive(Debug, Clone, Copy)]
pub struct DetectorInput<'a> {
    /// Participants, stage by stage in execution order.
    pub participants: &'a [Participant],
    /// In-scope active tools.
    pub tools: &'a [ToolDescriptor],
}

impl<'a> DetectorInput<'a> {
    /// Participants that actually run in their stage.
    pub fn executing(&self) -> impl Iterator<Item = &'a Participant> {
        self.participants.iter().filter(|p| !p.trigger_only)
    }
}

/// A pure function from participants to conflicts.
pub trait Detector: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Detects conflicts. Must be deterministic.
    fn detect(&self, input: &DetectorInput<'_>) -> Vec<Conflict>;
}

/// Every built-in detector.
pub fn default_detectors() -> Vec<Arc<dyn Detector>> {
    vec![
        Arc::new(CommandConflictDetector),
        Arc::new(ToolNameDetector),
        Arc::new(PriorityTieDetector),
        Arc::new(DuplicateSendDetector),
        Arc::new(PromptOverwriteDetector),
        Arc::new(StopInterceptionDetector),
        Arc::new(ResultChainMutationDetector),
    ]
}

/// Runs `detectors` and returns conflicts ordered by type then id, without
/// duplicate ids.
pub fn run_detectors(
    detectors: &[Arc<dyn Detector>],
    participants: &[Participant],
    tools: &[ToolDescriptor],
) -> Vec<Conflict> {
    let input = DetectorInput {
        participants,
        tools,
    };
    let mut conflicts: Vec<Conflict> = detectors
        .iter()
        .flat_map(|detector| {
            let found = detector.detect(&input);
            tracing::debug!(detector = detector.name(), found = found.len(), "Ran detector");
            found
        })
        .collect();
    conflicts.sort_by(|a, b| (a.conflict_type, &a.id).cmp(&(b.conflict_type, &b.id)));
    conflicts.dedup_by(|a, b| a.id == b.id);
    conflicts
}

/// `"a", "b" and "c"` style listing.
pub(crate) fn list_names<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    let names: Vec<String> = names.into_iter().map(|n| format!("'{n}'")).collect();
    match names.as_slice() {
        [] => String::new(),
        [only] => only.clone(),
        [init @ .., last] => format!("{} and {last}", init.join(", ")),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::participant;
    use super::*;
    use crate::effect::{EffectOperation, EffectTarget, Provenance, RiskSummary};
    use crate::scanner::fallback_effects;

    #[test]
    fn test_detectors_are_deterministic() {
        let participants = vec![
            participant(
                Stage::Process,
                EventType::OnLlmRequest,
                "a",
                "x",
                0,
                &[(EffectTarget::SystemPrompt, EffectOperation::Overwrite)],
            ),
            participant(
                Stage::Process,
                EventType::OnLlmRequest,
                "b",
                "y",
                0,
                &[
                    (EffectTarget::SystemPrompt, EffectOperation::Overwrite),
                    (EffectTarget::Stop, EffectOperation::Call),
                ],
            ),
        ];
        let detectors = default_detectors();
        let first = run_detectors(&detectors, &participants, &[]);
        let second = run_detectors(&detectors, &participants, &[]);
        assert!(!first.is_empty());
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_fallback_only_participants_raise_nothing() {
        let mut participants = Vec::new();
        for event_type in EventType::ALL {
            for &stage in event_type.stages() {
                for plugin in ["a", "b"] {
                    let mut p = participant(stage, event_type, plugin, "h", 0, &[]);
                    p.effects = fallback_effects(event_type);
                    p.risk = RiskSummary::from_effects(&p.effects);
                    p.provenance = Provenance::Fallback;
                    participants.push(p);
                }
            }
        }
        assert!(participants.iter().all(|p| p.risk.unknown));

        let found = run_detectors(&default_detectors(), &participants, &[]);
        assert!(found.is_empty(), "unexpected conflicts: {found:?}");
    }

    #[test]
    fn test_conflict_id_ignores_involved_order() {
        let a = Involved {
            plugin: "a".into(),
            name: "a_x".into(),
            stage: None,
            event_type: None,
            priority: None,
        };
        let b = Involved {
            name: "b_y".into(),
            ..a.clone()
        };
        let one = Conflict::new(ConflictType::ToolName, Severity::Warn, "t", "d", vec![a.clone(), b.clone()], "s");
        let two = Conflict::new(ConflictType::ToolName, Severity::Warn, "t", "other", vec![b, a], "s");
        assert_eq!(one.id, two.id);
        assert_eq!(one.id.len(), 12);
    }

    #[test]
    fn test_list_names() {
        assert_eq!(list_names(["a"]), "'a'");
        assert_eq!(list_names(["a", "b", "c"]), "'a', 'b' and 'c'");
    }
}
