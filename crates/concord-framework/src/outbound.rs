//! The outbound messaging API handlers use to reach platforms.

use async_trait::async_trait;
use concord_core::{MessageChain, MessageOrigin};

use crate::error::OutboundError;
use crate::llm::ProviderRequest;

/// Sends messages and reactions back to a platform.
///
/// The live runtime implements this over its adapters; the dry-run engine
/// implements it with an interceptor that performs nothing and returns
/// [`OutboundError::Blocked`].
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Sends one message to `origin`.
    async fn send(&self, origin: &MessageOrigin, chain: MessageChain) -> Result<(), OutboundError>;

    /// Sends a message in chunks.
    async fn send_streaming(
        &self,
        origin: &MessageOrigin,
        chunks: Vec<MessageChain>,
    ) -> Result<(), OutboundError> {
        for chunk in chunks {
            self.send(origin, chunk).await?;
        }
        Ok(())
    }

    /// Reacts to a message with an emoji.
    async fn react(
        &self,
        origin: &MessageOrigin,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), OutboundError>;

    /// Issues a nested LLM request and returns the completion text.
    async fn request_llm(&self, request: ProviderRequest) -> Result<String, OutboundError>;
}

/// An outbound sink that accepts and discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOutbound;

#[async_trait]
impl Outbound for NoopOutbound {
    async fn send(&self, _: &MessageOrigin, _: MessageChain) -> Result<(), OutboundError> {
        Ok(())
    }

    async fn react(&self, _: &MessageOrigin, _: &str, _: &str) -> Result<(), OutboundError> {
        Ok(())
    }

    async fn request_llm(&self, _: ProviderRequest) -> Result<String, OutboundError> {
        Ok(String::new())
    }
}
