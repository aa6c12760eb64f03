//! Order-dependent risks: priority ties, stops and duplicate sends.

use std::collections::BTreeMap;

use concord_core::{EventType, Stage};

use super::{Conflict, ConflictType, Detector, DetectorInput, Involved, Severity, list_names};
use crate::snapshot::Participant;

fn risk_labels(p: &Participant) -> Vec<&'static str> {
    let mut labels = Vec::new();
    if p.risk.may_stop {
        labels.push("may stop the event");
    }
    if p.risk.duplicate_send() {
        labels.push("may send twice");
    } else if p.risk.may_send {
        labels.push("sends directly");
    }
    if p.risk.may_mutate_prompt {
        labels.push("edits the LLM request");
    }
    labels
}

/// Participants sharing stage, event type and priority where at least one
/// of them is order-sensitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityTieDetector;

impl Detector for PriorityTieDetector {
    fn name(&self) -> &'static str {
        "priority_tie"
    }

    fn detect(&self, input: &DetectorInput<'_>) -> Vec<Conflict> {
        let mut groups: BTreeMap<(Stage, EventType, i64), Vec<&Participant>> = BTreeMap::new();
        for p in input.executing() {
            groups.entry((p.stage, p.event_type, p.priority)).or_default().push(p);
        }

        groups
            .into_iter()
            .filter(|(_, members)| members.len() >= 2)
            .filter(|(_, members)| members.iter().any(|p| p.risk.is_order_sensitive()))
            .map(|((stage, event_type, priority), members)| {
                let risky: Vec<String> = members
                    .iter()
                    .filter(|p| p.risk.is_order_sensitive())
                    .map(|p| format!("'{}' ({})", p.full_name, risk_labels(p).join(", ")))
                    .collect();
                Conflict::new(
                    ConflictType::PriorityTie,
                    Severity::Warn,
                    format!(
                        "{} {event_type} handlers share priority {priority} in {stage}",
                        members.len()
                    ),
                    format!(
                        "Their relative order falls back to registration order, which changes \
                         with load order. Order-sensitive: {}.",
                        risky.join("; ")
                    ),
                    members.iter().map(|p| Involved::participant(p)).collect(),
                    "Assign distinct priorities to make the intended order explicit.",
                )
            })
            .collect()
    }
}

/// A handler that sends directly and also sets the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateSendDetector;

impl Detector for DuplicateSendDetector {
    fn name(&self) -> &'static str {
        "duplicate_send"
    }

    fn detect(&self, input: &DetectorInput<'_>) -> Vec<Conflict> {
        input
            .executing()
            .filter(|p| p.risk.duplicate_send())
            .map(|p| {
                Conflict::new(
                    ConflictType::DuplicateSend,
                    Severity::Warn,
                    format!("'{}' may reply twice", p.full_name),
                    format!(
                        "'{}' sends a message directly and also sets the event result, which \
                         the respond stage sends again.",
                        p.full_name
                    ),
                    vec![Involved::participant(p)],
                    "Either send directly and clear the result, or only set the result.",
                )
            })
            .collect()
    }
}

/// A handler that may stop the event, hiding later same-stage handlers and
/// every downstream stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopInterceptionDetector;

impl Detector for StopInterceptionDetector {
    fn name(&self) -> &'static str {
        "stop_interception"
    }

    fn detect(&self, input: &DetectorInput<'_>) -> Vec<Conflict> {
        let executing: Vec<&Participant> = input.executing().collect();
        executing
            .iter()
            .enumerate()
            .filter(|(_, p)| p.risk.may_stop)
            .map(|(index, stopper)| {
                let later: Vec<&Participant> = executing[index + 1..]
                    .iter()
                    .filter(|p| p.stage == stopper.stage)
                    .copied()
                    .collect();
                let downstream: Vec<String> =
                    stopper.stage.downstream().map(|s| s.to_string()).collect();

                let mut involved = vec![Involved::participant(stopper)];
                involved.extend(later.iter().map(|p| Involved::participant(p)));
                let skipped = if later.is_empty() {
                    "No later handler in the same stage is affected".to_string()
                } else {
                    format!(
                        "Handlers {} run later in {} and may never run",
                        list_names(later.iter().map(|p| p.full_name.as_str())),
                        stopper.stage
                    )
                };
                Conflict::new(
                    ConflictType::StopInterception,
                    Severity::Warn,
                    format!("'{}' may stop the event in {}", stopper.full_name, stopper.stage),
                    format!(
                        "{skipped}. Stages after {} are skipped except for delivering a result \
                         that was already set.",
                        stopper.stage
                    ),
                    involved,
                    "Stop only on a clearly scoped condition, or lower the handler's priority \
                     so others run first.",
                )
                .with_references(downstream)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::test_support::participant;
    use crate::effect::{EffectOperation, EffectTarget};

    const STOP: (EffectTarget, EffectOperation) = (EffectTarget::Stop, EffectOperation::Call);

    #[test]
    fn test_priority_tie_needs_a_risky_member() {
        let quiet = vec![
            participant(Stage::Process, EventType::AdapterMessage, "a", "x", 0, &[]),
            participant(Stage::Process, EventType::AdapterMessage, "b", "y", 0, &[]),
        ];
        let input = DetectorInput {
            participants: &quiet,
            tools: &[],
        };
        assert!(PriorityTieDetector.detect(&input).is_empty());

        let mut risky = quiet.clone();
        risky.push(participant(Stage::Process, EventType::AdapterMessage, "c", "z", 0, &[STOP]));
        risky.push(participant(Stage::Process, EventType::AdapterMessage, "d", "w", 1, &[STOP]));
        let found = PriorityTieDetector.detect(&DetectorInput {
            participants: &risky,
            tools: &[],
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].involved.len(), 3);
    }

    #[test]
    fn test_stop_interception_references_downstream() {
        let ps = vec![
            participant(Stage::Process, EventType::AdapterMessage, "a", "guard", 10, &[STOP]),
            participant(Stage::Process, EventType::AdapterMessage, "b", "reply", 0, &[]),
            participant(Stage::ResultDecorate, EventType::OnDecoratingResult, "c", "deco", 0, &[]),
        ];
        let found = StopInterceptionDetector.detect(&DetectorInput {
            participants: &ps,
            tools: &[],
        });
        assert_eq!(found.len(), 1);
        let names: Vec<&str> = found[0].involved.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a_guard", "b_reply"]);
        assert_eq!(found[0].references, vec!["result_decorate", "respond"]);
    }

    #[test]
    fn test_duplicate_send() {
        let ps = vec![participant(
            Stage::Process,
            EventType::AdapterMessage,
            "a",
            "echo",
            0,
            &[
                (EffectTarget::Send, EffectOperation::Call),
                (EffectTarget::Result, EffectOperation::Overwrite),
            ],
        )];
        let found = DuplicateSendDetector.detect(&DetectorInput {
            participants: &ps,
            tools: &[],
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].conflict_type, ConflictType::DuplicateSend);
    }
}
