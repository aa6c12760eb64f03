//! The side-effect taxonomy the scanner infers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What an effect touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EffectTarget {
    /// The user prompt of the LLM request.
    #[serde(rename = "llm_request.prompt")]
    Prompt,
    /// The system prompt of the LLM request.
    #[serde(rename = "llm_request.system_prompt")]
    SystemPrompt,
    /// Extra content parts of the LLM request.
    #[serde(rename = "llm_request.extra_user_content_parts")]
    ExtraContentParts,
    /// Conversation history of the LLM request.
    #[serde(rename = "llm_request.contexts")]
    Contexts,
    /// The event result as a whole.
    #[serde(rename = "event.result")]
    Result,
    /// The segment list of the event result.
    #[serde(rename = "event.result.chain")]
    ResultChain,
    /// Stopping the event.
    #[serde(rename = "event.stop")]
    Stop,
    /// Sending a message directly.
    #[serde(rename = "event.send")]
    Send,
    /// Reacting to the message.
    #[serde(rename = "event.react")]
    React,
    /// A nested LLM request.
    #[serde(rename = "event.llm_request")]
    LlmRequest,
    /// Persona prompt text outside dispatch.
    #[serde(rename = "persona.prompt")]
    PersonaPrompt,
    /// Anything the scanner could not classify.
    #[serde(rename = "unknown")]
    Unknown,
}

impl EffectTarget {
    /// The dotted path of the target.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "llm_request.prompt",
            Self::SystemPrompt => "llm_request.system_prompt",
            Self::ExtraContentParts => "llm_request.extra_user_content_parts",
            Self::Contexts => "llm_request.contexts",
            Self::Result => "event.result",
            Self::ResultChain => "event.result.chain",
            Self::Stop => "event.stop",
            Self::Send => "event.send",
            Self::React => "event.react",
            Self::LlmRequest => "event.llm_request",
            Self::PersonaPrompt => "persona.prompt",
            Self::Unknown => "unknown",
        }
    }

    /// Request fields holding text.
    pub fn is_prompt_text(&self) -> bool {
        matches!(self, Self::Prompt | Self::SystemPrompt)
    }

    /// Targets that change what the LLM sees.
    pub fn is_prompt_like(&self) -> bool {
        matches!(
            self,
            Self::Prompt
                | Self::SystemPrompt
                | Self::ExtraContentParts
                | Self::Contexts
                | Self::PersonaPrompt
        )
    }

    /// Targets that change the reply.
    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result | Self::ResultChain)
    }
}

impl fmt::Display for EffectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the target is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectOperation {
    /// Adds to existing content.
    Append,
    /// Replaces existing content.
    Overwrite,
    /// Empties the target.
    Clear,
    /// Edits a list in place.
    MutateList,
    /// Invokes an action.
    Call,
    /// May do any of the above; used only by the fallback policy.
    Unknown,
}

impl EffectOperation {
    /// Clear and overwrite discard earlier work.
    pub fn is_high_impact(&self) -> bool {
        matches!(self, Self::Clear | Self::Overwrite)
    }

    /// Append and in-place list edits build on earlier work.
    pub fn is_mid_impact(&self) -> bool {
        matches!(self, Self::Append | Self::MutateList)
    }

    /// The snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Overwrite => "overwrite",
            Self::Clear => "clear",
            Self::MutateList => "mutate_list",
            Self::Call => "call",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EffectOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How certain the scanner is that the effect happens.
///
/// Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Inside a closure, async block or nested item.
    Low,
    /// Inside a branch, loop or match arm.
    Medium,
    /// Straight-line code of the handler body.
    High,
}

impl Confidence {
    /// The snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Where in the source an effect was found.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceLocation {
    /// File path or `<inline>`.
    pub file: String,
    /// 1-based line.
    pub line: usize,
    /// 1-based column.
    pub column: usize,
}

impl SourceLocation {
    pub(crate) fn from_span(file: &str, span: proc_macro2::Span) -> Self {
        let start = span.start();
        Self {
            file: file.to_string(),
            line: start.line,
            column: start.column + 1,
        }
    }
}

/// One inferred side effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Effect {
    /// What is touched.
    pub target: EffectTarget,
    /// How it is touched.
    pub operation: EffectOperation,
    /// How certain the inference is.
    pub confidence: Confidence,
    /// The rule that produced the effect (`method:push_str`, `assign`,
    /// `manifest`, `fallback:on_llm_request`, ...).
    pub evidence: String,
    /// Source position, when scanned from source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl Effect {
    /// Creates an effect without a location.
    pub fn new(
        target: EffectTarget,
        operation: EffectOperation,
        confidence: Confidence,
        evidence: impl Into<String>,
    ) -> Self {
        Self {
            target,
            operation,
            confidence,
            evidence: evidence.into(),
            location: None,
        }
    }

    /// Attaches a location (builder style).
    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Normalized `target:operation:confidence` key used for hashing.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.target,
            self.operation,
            self.confidence.as_str()
        )
    }
}

/// Where a handler's effects came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Parsed from the handler's source.
    Source,
    /// Declared in the plugin's effect manifest.
    Manifest,
    /// Assumed from the event type.
    Fallback,
}

/// Risk flags derived from a handler's effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSummary {
    /// May stop the event.
    pub may_stop: bool,
    /// May send a message directly.
    pub may_send: bool,
    /// May set or edit the result.
    pub may_set_result: bool,
    /// May change prompt, system prompt, contexts or content parts.
    pub may_mutate_prompt: bool,
    /// Clears or overwrites the result.
    pub may_discard_result: bool,
    /// Some effects are assumed rather than found.
    pub unknown: bool,
}

impl RiskSummary {
    /// Derives the flags from a list of effects.
    pub fn from_effects(effects: &[Effect]) -> Self {
        let mut risk = Self::default();
        for effect in effects {
            // Fallback effects only mark the handler as opaque.
            if effect.operation == EffectOperation::Unknown {
                risk.unknown = true;
                continue;
            }
            match effect.target {
                EffectTarget::Stop => risk.may_stop = true,
                EffectTarget::Send => risk.may_send = true,
                EffectTarget::Result | EffectTarget::ResultChain => {
                    if effect.operation.is_high_impact() {
                        risk.may_discard_result = true;
                    }
                    if effect.operation != EffectOperation::Clear {
                        risk.may_set_result = true;
                    }
                }
                EffectTarget::Unknown => risk.unknown = true,
                target if target.is_prompt_like() => risk.may_mutate_prompt = true,
                _ => {}
            }
        }
        risk
    }

    /// Sends directly and also sets a result: the reply may go out twice.
    pub fn duplicate_send(&self) -> bool {
        self.may_send && self.may_set_result
    }

    /// Whether the handler's position in the order matters to others.
    pub fn is_order_sensitive(&self) -> bool {
        self.may_stop || self.may_send || self.may_mutate_prompt || self.duplicate_send()
    }

    /// Whether any flag is set.
    pub fn any(&self) -> bool {
        self.may_stop
            || self.may_send
            || self.may_set_result
            || self.may_mutate_prompt
            || self.may_discard_result
            || self.unknown
    }
}

/// The scanner's verdict for one handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerEffects {
    /// Inferred effects in source order.
    pub effects: Vec<Effect>,
    /// Where the effects came from.
    pub provenance: Provenance,
    /// Why scanning degraded, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
    /// Flags derived from `effects`.
    pub risk: RiskSummary,
}

impl HandlerEffects {
    pub(crate) fn new(effects: Vec<Effect>, provenance: Provenance, degraded: Option<String>) -> Self {
        let risk = RiskSummary::from_effects(&effects);
        Self {
            effects,
            provenance,
            degraded,
            risk,
        }
    }

    /// Effects on `target`.
    pub fn on(&self, target: EffectTarget) -> impl Iterator<Item = &Effect> {
        self.effects.iter().filter(move |e| e.target == target)
    }

    /// Highest confidence of any effect on `target`.
    pub fn confidence_of(&self, target: EffectTarget) -> Option<Confidence> {
        self.on(target).map(|e| e.confidence).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_order() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
    }

    #[test]
    fn test_risk_flags() {
        let effects = vec![
            Effect::new(EffectTarget::Send, EffectOperation::Call, Confidence::High, "method:send"),
            Effect::new(EffectTarget::ResultChain, EffectOperation::Append, Confidence::Medium, "method:push"),
        ];
        let risk = RiskSummary::from_effects(&effects);
        assert!(risk.duplicate_send());
        assert!(risk.is_order_sensitive());
        assert!(!risk.may_discard_result);

        let risk = RiskSummary::from_effects(&[Effect::new(
            EffectTarget::SystemPrompt,
            EffectOperation::Unknown,
            Confidence::Low,
            "fallback:on_llm_request",
        )]);
        assert!(!risk.may_mutate_prompt);
        assert!(!risk.is_order_sensitive());
        assert!(risk.unknown);
    }

    #[test]
    fn test_target_serializes_as_path() {
        let json = serde_json::to_string(&EffectTarget::SystemPrompt).unwrap();
        assert_eq!(json, "\"llm_request.system_prompt\"");
    }
}
