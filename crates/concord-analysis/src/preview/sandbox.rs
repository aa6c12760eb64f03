//! An outbound sink that intercepts every side effect.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use concord_core::{MessageChain, MessageOrigin};
use concord_framework::{OutboundAction, OutboundError, Outbound, ProviderRequest};

/// One intercepted outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedAttempt {
    /// What was attempted.
    pub action: OutboundAction,
    /// Short description of the payload.
    pub detail: String,
}

/// Records every outbound call and answers each with
/// [`OutboundError::Blocked`].
#[derive(Debug, Default)]
pub struct SandboxOutbound {
    attempts: Mutex<Vec<BlockedAttempt>>,
}

impl SandboxOutbound {
    /// Creates an empty sandbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt so far, in call order.
    pub fn attempts(&self) -> Vec<BlockedAttempt> {
        self.attempts.lock().clone()
    }

    /// Number of attempts so far.
    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Attempts recorded at or after index `from`.
    pub fn attempts_since(&self, from: usize) -> Vec<BlockedAttempt> {
        self.attempts.lock().get(from..).map(<[_]>::to_vec).unwrap_or_default()
    }

    fn block(&self, action: OutboundAction, detail: String) -> OutboundError {
        debug!(action = %action, detail = %detail, "Blocked outbound call");
        self.attempts.lock().push(BlockedAttempt { action, detail });
        OutboundError::Blocked { action }
    }
}

fn truncate(text: &str) -> String {
    const MAX: usize = 80;
    match text.char_indices().nth(MAX) {
        Some((at, _)) => format!("{}…", &text[..at]),
        None => text.to_string(),
    }
}

#[async_trait]
impl Outbound for SandboxOutbound {
    async fn send(&self, origin: &MessageOrigin, chain: MessageChain) -> Result<(), OutboundError> {
        Err(self.block(
            OutboundAction::Send,
            format!("{origin}: {}", truncate(&chain.plain_text())),
        ))
    }

    async fn send_streaming(
        &self,
        origin: &MessageOrigin,
        chunks: Vec<MessageChain>,
    ) -> Result<(), OutboundError> {
        Err(self.block(
            OutboundAction::Stream,
            format!("{origin}: {} chunk(s)", chunks.len()),
        ))
    }

    async fn react(
        &self,
        origin: &MessageOrigin,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), OutboundError> {
        Err(self.block(
            OutboundAction::React,
            format!("{origin}: {emoji} on '{message_id}'"),
        ))
    }

    async fn request_llm(&self, request: ProviderRequest) -> Result<String, OutboundError> {
        Err(self.block(OutboundAction::LlmRequest, truncate(&request.prompt)))
    }
}

#[cfg(test)]
mod tests {
    use concord_core::MessageType;

    use super::*;

    #[tokio::test]
    async fn test_every_action_is_blocked_and_recorded() {
        let sandbox = SandboxOutbound::new();
        let origin = MessageOrigin::new("qq", MessageType::GroupMessage, "1");

        let err = sandbox
            .send(&origin, MessageChain::new().text("hi"))
            .await
            .unwrap_err();
        assert!(err.is_blocked());
        assert!(sandbox.react(&origin, "m1", "👍").await.is_err());
        assert!(
            sandbox
                .send_streaming(&origin, vec![MessageChain::new().text("a")])
                .await
                .is_err()
        );
        assert!(sandbox.request_llm(ProviderRequest::new("q")).await.is_err());

        let actions: Vec<OutboundAction> = sandbox.attempts().iter().map(|a| a.action).collect();
        assert_eq!(
            actions,
            vec![
                OutboundAction::Send,
                OutboundAction::React,
                OutboundAction::Stream,
                OutboundAction::LlmRequest
            ]
        );
        assert_eq!(sandbox.attempts_since(3).len(), 1);
        assert!(sandbox.attempts()[0].detail.ends_with("hi"));
    }
}
