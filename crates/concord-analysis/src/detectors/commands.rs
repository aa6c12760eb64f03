//! Namespace collisions: command names, aliases and tool names.

use std::collections::BTreeMap;

use super::{Conflict, ConflictType, Detector, DetectorInput, Involved, Severity, list_names};
use crate::snapshot::Participant;

/// Two or more command handlers answering to the same name.
///
/// When every claimant uses the name as its canonical signature the conflict
/// is a name conflict; when the name is an alias of at least one claimant it
/// is an alias conflict.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandConflictDetector;

impl Detector for CommandConflictDetector {
    fn name(&self) -> &'static str {
        "command"
    }

    fn detect(&self, input: &DetectorInput<'_>) -> Vec<Conflict> {
        // name -> full_name -> (participant, canonical)
        let mut claims: BTreeMap<&str, BTreeMap<&str, (&Participant, bool)>> = BTreeMap::new();
        for p in input.executing() {
            let Some(command) = &p.command else { continue };
            for name in command.all_names() {
                let canonical = name == command.name;
                claims
                    .entry(name)
                    .or_default()
                    .entry(p.full_name.as_str())
                    .and_modify(|(_, c)| *c |= canonical)
                    .or_insert((p, canonical));
            }
        }

        claims
            .into_iter()
            .filter(|(_, claimants)| claimants.len() >= 2)
            .map(|(name, claimants)| {
                let all_canonical = claimants.values().all(|(_, canonical)| *canonical);
                let involved: Vec<Involved> =
                    claimants.values().map(|(p, _)| Involved::handler(p)).collect();
                let handlers = list_names(claimants.keys().copied());
                let (conflict_type, title) = if all_canonical {
                    (ConflictType::CommandName, format!("Command '{name}' is registered {} times", claimants.len()))
                } else {
                    (ConflictType::CommandAlias, format!("Command alias '{name}' is claimed {} times", claimants.len()))
                };
                Conflict::new(
                    conflict_type,
                    Severity::Warn,
                    title,
                    format!(
                        "Handlers {handlers} all answer to '{name}'. Only the first one in \
                         priority order is activated for a given message."
                    ),
                    involved,
                    "Rename or drop the command or alias in all but one plugin, or disable \
                     the competing plugin in the affected sessions.",
                )
            })
            .collect()
    }
}

/// Two or more active tools sharing a name.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolNameDetector;

impl Detector for ToolNameDetector {
    fn name(&self) -> &'static str {
        "tool_name"
    }

    fn detect(&self, input: &DetectorInput<'_>) -> Vec<Conflict> {
        let mut by_name: BTreeMap<&str, Vec<Involved>> = BTreeMap::new();
        for tool in input.tools.iter().filter(|t| t.active) {
            by_name.entry(tool.name.as_str()).or_default().push(Involved::tool(tool));
        }

        by_name
            .into_iter()
            .filter(|(_, owners)| owners.len() >= 2)
            .map(|(name, mut owners)| {
                owners.sort();
                let providers = list_names(owners.iter().map(|o| o.plugin.as_str()));
                Conflict::new(
                    ConflictType::ToolName,
                    Severity::Warn,
                    format!("Tool '{name}' is provided {} times", owners.len()),
                    format!(
                        "{providers} all expose a tool named '{name}'. The LLM cannot tell \
                         them apart and only one of them will be callable."
                    ),
                    owners,
                    "Rename the tool in one provider or deactivate the duplicate.",
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use concord_core::{EventType, Stage};
    use concord_framework::{CommandSpec, ToolDescriptor};

    use super::*;
    use crate::detectors::test_support::participant;

    fn command(plugin: &str, name: &str, aliases: &[&str]) -> Participant {
        let mut p = participant(Stage::Process, EventType::AdapterMessage, plugin, name, 0, &[]);
        p.command = Some(CommandSpec {
            name: name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            group: false,
        });
        p
    }

    #[test]
    fn test_same_name_is_name_conflict() {
        let ps = vec![command("a", "ping", &[]), command("b", "ping", &[])];
        let found = CommandConflictDetector.detect(&DetectorInput {
            participants: &ps,
            tools: &[],
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].conflict_type, ConflictType::CommandName);
        assert_eq!(found[0].severity, Severity::Warn);
        let names: Vec<&str> = found[0].involved.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a_ping", "b_ping"]);
    }

    #[test]
    fn test_alias_collision_is_alias_conflict() {
        let ps = vec![command("a", "help", &["h"]), command("b", "h", &[])];
        let found = CommandConflictDetector.detect(&DetectorInput {
            participants: &ps,
            tools: &[],
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].conflict_type, ConflictType::CommandAlias);
    }

    #[test]
    fn test_trigger_only_duplicates_are_ignored() {
        let mut trigger = command("a", "ping", &[]);
        trigger.stage = Stage::Waking;
        trigger.trigger_only = true;
        let ps = vec![trigger, command("a", "ping", &[])];
        let found = CommandConflictDetector.detect(&DetectorInput {
            participants: &ps,
            tools: &[],
        });
        assert!(found.is_empty());
    }

    #[test]
    fn test_tool_name_conflict_across_origins() {
        let mut inactive = ToolDescriptor::local("search", "plugins.c");
        inactive.active = false;
        let tools = vec![
            ToolDescriptor::local("search", "plugins.a"),
            ToolDescriptor::mcp("search", "web-mcp"),
            inactive,
            ToolDescriptor::local("weather", "plugins.a"),
        ];
        let found = ToolNameDetector.detect(&DetectorInput {
            participants: &[],
            tools: &tools,
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].involved.len(), 2);
    }
}
