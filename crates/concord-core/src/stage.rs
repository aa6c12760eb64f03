//! The ordered stages of the message processing pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One phase of the processing pipeline.
///
/// The derived ordering is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Decides whether the bot should react to the message at all.
    Waking,
    /// Session / sender whitelisting.
    Whitelist,
    /// Per-session enable switch.
    SessionStatus,
    /// Rate limiting.
    RateLimit,
    /// Content moderation.
    ContentSafety,
    /// Pre-processing (speech-to-text, media download, ...).
    PreProcess,
    /// Plugin handlers and LLM calls.
    Process,
    /// Decoration of the result before sending.
    ResultDecorate,
    /// Sending the result.
    Respond,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 9] = [
        Self::Waking,
        Self::Whitelist,
        Self::SessionStatus,
        Self::RateLimit,
        Self::ContentSafety,
        Self::PreProcess,
        Self::Process,
        Self::ResultDecorate,
        Self::Respond,
    ];

    /// Returns the snake_case name of this stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waking => "waking",
            Self::Whitelist => "whitelist",
            Self::SessionStatus => "session_status",
            Self::RateLimit => "rate_limit",
            Self::ContentSafety => "content_safety",
            Self::PreProcess => "pre_process",
            Self::Process => "process",
            Self::ResultDecorate => "result_decorate",
            Self::Respond => "respond",
        }
    }

    /// Returns every stage that runs after this one.
    pub fn downstream(self) -> impl Iterator<Item = Stage> {
        Self::ALL.into_iter().filter(move |s| *s > self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_matches_pipeline() {
        let mut sorted = Stage::ALL;
        sorted.sort();
        assert_eq!(sorted, Stage::ALL);
        assert!(Stage::Waking < Stage::Respond);
    }

    #[test]
    fn test_downstream() {
        let after: Vec<_> = Stage::Process.downstream().collect();
        assert_eq!(after, vec![Stage::ResultDecorate, Stage::Respond]);
        assert_eq!(Stage::Respond.downstream().count(), 0);
    }
}
