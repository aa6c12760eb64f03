//! Competing writes to the LLM request and to the result chain.

use std::collections::BTreeMap;

use concord_core::{EventType, Stage};

use super::{Conflict, ConflictType, Detector, DetectorInput, Involved, Severity, list_names};
use crate::effect::{EffectOperation, EffectTarget};
use crate::snapshot::Participant;

fn touches(p: &Participant, target: EffectTarget, pred: impl Fn(EffectOperation) -> bool) -> bool {
    p.effects
        .iter()
        .any(|e| e.target == target && pred(e.operation))
}

/// Writers that replace `prompt` or `system_prompt` while others write too.
///
/// Two or more overwriters are an error: only the last one's text survives.
/// One overwriter next to appenders is a warning: whichever runs first may
/// lose its text. Effects assumed by the fallback policy never count.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptOverwriteDetector;

impl PromptOverwriteDetector {
    fn detect_field(
        input: &DetectorInput<'_>,
        target: EffectTarget,
        conflict_type: ConflictType,
        field: &str,
    ) -> Option<Conflict> {
        let writers: Vec<&Participant> = input
            .executing()
            .filter(|p| touches(p, target, |op| op.is_high_impact() || op == EffectOperation::Append))
            .collect();
        let overwriters: Vec<&Participant> = writers
            .iter()
            .copied()
            .filter(|p| touches(p, target, |op| op.is_high_impact()))
            .collect();
        let appenders: Vec<&Participant> = writers
            .iter()
            .copied()
            .filter(|p| !touches(p, target, |op| op.is_high_impact()))
            .collect();

        let severity = match (overwriters.len(), appenders.len()) {
            (n, _) if n >= 2 => Severity::Error,
            (1, a) if a >= 1 => Severity::Warn,
            _ => return None,
        };

        let overwriter_names = list_names(overwriters.iter().map(|p| p.full_name.as_str()));
        let description = if severity == Severity::Error {
            format!(
                "{overwriter_names} all replace {field}; only the text written last reaches \
                 the model."
            )
        } else {
            let appender_names = list_names(appenders.iter().map(|p| p.full_name.as_str()));
            let runs_after = writers
                .iter()
                .position(|p| overwriters.contains(p))
                .is_some_and(|first_overwrite| first_overwrite > 0);
            let order = if runs_after {
                "runs after at least one of them and discards their text"
            } else {
                "runs first, so their text survives only if it is appended afterwards"
            };
            format!(
                "{overwriter_names} replaces {field} while {appender_names} append to it. \
                 The overwriter {order}."
            )
        };

        Some(Conflict::new(
            conflict_type,
            severity,
            format!("Competing writes to {field}"),
            description,
            writers.iter().map(|p| Involved::participant(p)).collect(),
            format!("Append to {field} instead of assigning it, or give the overwriter the highest priority."),
        ))
    }
}

impl Detector for PromptOverwriteDetector {
    fn name(&self) -> &'static str {
        "prompt_overwrite"
    }

    fn detect(&self, input: &DetectorInput<'_>) -> Vec<Conflict> {
        [
            (EffectTarget::Prompt, ConflictType::PromptOverwrite, "prompt"),
            (
                EffectTarget::SystemPrompt,
                ConflictType::SystemPromptOverwrite,
                "system_prompt",
            ),
        ]
        .into_iter()
        .filter_map(|(target, conflict_type, field)| {
            Self::detect_field(input, target, conflict_type, field)
        })
        .collect()
    }
}

/// Handlers of one stage and event type editing the result chain in ways
/// that discard each other's work.
///
/// Counted per handler: two or more that clear or overwrite are an error,
/// one that clears or overwrites next to others that append or edit is a
/// warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultChainMutationDetector;

impl Detector for ResultChainMutationDetector {
    fn name(&self) -> &'static str {
        "result_chain_mutation"
    }

    fn detect(&self, input: &DetectorInput<'_>) -> Vec<Conflict> {
        let mut groups: BTreeMap<(Stage, EventType), (Vec<&Participant>, Vec<&Participant>)> =
            BTreeMap::new();
        for p in input.executing() {
            let high = touches(p, EffectTarget::ResultChain, |op| op.is_high_impact());
            let mid = touches(p, EffectTarget::ResultChain, |op| op.is_mid_impact());
            let (highs, mids) = groups.entry((p.stage, p.event_type)).or_default();
            if high {
                highs.push(p);
            } else if mid {
                mids.push(p);
            }
        }

        groups
            .into_iter()
            .filter_map(|((stage, event_type), (highs, mids))| {
                let severity = match (highs.len(), mids.len()) {
                    (h, _) if h >= 2 => Severity::Error,
                    (1, m) if m >= 1 => Severity::Warn,
                    _ => return None,
                };
                let high_names = list_names(highs.iter().map(|p| p.full_name.as_str()));
                let description = if mids.is_empty() {
                    format!("{high_names} each clear or replace the result chain in {stage}.")
                } else {
                    format!(
                        "{high_names} clears or replaces the result chain in {stage} while {} \
                         edit it; edits made before the clear are lost.",
                        list_names(mids.iter().map(|p| p.full_name.as_str()))
                    )
                };
                let mut involved: Vec<Involved> =
                    highs.iter().map(|p| Involved::participant(p)).collect();
                involved.extend(mids.iter().map(|p| Involved::participant(p)));
                Some(Conflict::new(
                    ConflictType::ResultChainMutation,
                    severity,
                    format!("Result chain edits collide in {stage} ({event_type})"),
                    description,
                    involved,
                    "Edit the chain in place instead of clearing it, or order the handlers so \
                     the replacing one runs first.",
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::test_support::participant;

    fn llm(plugin: &str, priority: i64, op: EffectOperation) -> Participant {
        participant(
            Stage::Process,
            EventType::OnLlmRequest,
            plugin,
            "h",
            priority,
            &[(EffectTarget::SystemPrompt, op)],
        )
    }

    fn detect(ps: &[Participant]) -> Vec<Conflict> {
        PromptOverwriteDetector.detect(&DetectorInput {
            participants: ps,
            tools: &[],
        })
    }

    #[test]
    fn test_append_then_overwrite_warns() {
        let found = detect(&[
            llm("a", 10, EffectOperation::Append),
            llm("b", 0, EffectOperation::Overwrite),
        ]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].conflict_type, ConflictType::SystemPromptOverwrite);
        assert_eq!(found[0].severity, Severity::Warn);
        assert!(found[0].description.contains("discards"));
        assert_eq!(found[0].involved.len(), 2);
    }

    #[test]
    fn test_two_overwriters_error() {
        let found = detect(&[
            llm("a", 1, EffectOperation::Overwrite),
            llm("b", 0, EffectOperation::Clear),
        ]);
        assert_eq!(found[0].severity, Severity::Error);
    }

    #[test]
    fn test_unknown_effects_never_conflict() {
        let found = detect(&[
            llm("a", 0, EffectOperation::Unknown),
            llm("b", 0, EffectOperation::Unknown),
            llm("c", 0, EffectOperation::Append),
        ]);
        assert!(found.is_empty());
    }

    #[test]
    fn test_result_chain_groups_by_stage_and_event() {
        let deco = |plugin: &str, op| {
            participant(
                Stage::ResultDecorate,
                EventType::OnDecoratingResult,
                plugin,
                "d",
                0,
                &[(EffectTarget::ResultChain, op)],
            )
        };
        let ps = vec![
            deco("a", EffectOperation::Clear),
            deco("b", EffectOperation::Append),
            participant(
                Stage::Process,
                EventType::AdapterMessage,
                "c",
                "p",
                0,
                &[(EffectTarget::ResultChain, EffectOperation::Overwrite)],
            ),
        ];
        let found = ResultChainMutationDetector.detect(&DetectorInput {
            participants: &ps,
            tools: &[],
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::Warn);

        let ps = vec![deco("a", EffectOperation::Clear), deco("b", EffectOperation::Overwrite)];
        let found = ResultChainMutationDetector.detect(&DetectorInput {
            participants: &ps,
            tools: &[],
        });
        assert_eq!(found[0].severity, Severity::Error);
    }
}
