//! Event system for the Concord framework.
//!
//! - [`MessageEvent`] - one inbound chat message, already translated out of
//!   the platform wire format by an adapter
//! - [`MessageOrigin`] - the unified message origin (UMO) identifying the
//!   session the message belongs to
//! - [`EventType`] - the tag a handler registers against

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::message::{MessageChain, MessageSegment};
use crate::stage::Stage;

// ============================================================================
// Message Type
// ============================================================================

/// The kind of conversation a message arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    /// One-to-one conversation with a user.
    FriendMessage,
    /// Group conversation.
    GroupMessage,
    /// Anything else (channels, system notices, ...).
    OtherMessage,
}

impl MessageType {
    /// Returns the canonical name used inside origin strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FriendMessage => "FriendMessage",
            Self::GroupMessage => "GroupMessage",
            Self::OtherMessage => "OtherMessage",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FriendMessage" | "friend" | "private" => Ok(Self::FriendMessage),
            "GroupMessage" | "group" => Ok(Self::GroupMessage),
            "OtherMessage" | "other" => Ok(Self::OtherMessage),
            other => Err(CoreError::UnknownMessageType(other.to_string())),
        }
    }
}

// ============================================================================
// Unified Message Origin
// ============================================================================

/// Identifies one chat session as `platform:message_type:session_id`.
///
/// The session id itself may contain `:`; only the first two separators are
/// significant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageOrigin {
    /// Id of the platform instance the session lives on.
    pub platform_id: String,
    /// Conversation kind.
    pub message_type: MessageType,
    /// Platform-specific session id (user id for friends, group id for groups).
    pub session_id: String,
}

impl MessageOrigin {
    /// Creates a new origin.
    pub fn new(
        platform_id: impl Into<String>,
        message_type: MessageType,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            platform_id: platform_id.into(),
            message_type,
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for MessageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.platform_id, self.message_type, self.session_id
        )
    }
}

impl FromStr for MessageOrigin {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(platform_id), Some(message_type), Some(session_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(CoreError::invalid_origin(
                s,
                "expected platform:message_type:session_id",
            ));
        };
        if platform_id.is_empty() || session_id.is_empty() {
            return Err(CoreError::invalid_origin(s, "empty platform or session id"));
        }
        let message_type = message_type
            .parse()
            .map_err(|e: CoreError| CoreError::invalid_origin(s, e.to_string()))?;
        Ok(Self::new(platform_id, message_type, session_id))
    }
}

// ============================================================================
// Message Event
// ============================================================================

/// Platform adapter identity carried by every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMeta {
    /// Adapter type name (e.g. `"onebot"`, `"telegram"`).
    pub name: String,
    /// Id of this platform instance, used as the origin's platform id.
    pub id: String,
}

/// The sender of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Platform user id.
    pub user_id: String,
    /// Display name, when known.
    #[serde(default)]
    pub nickname: Option<String>,
}

/// One inbound chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Adapter identity.
    pub platform: PlatformMeta,
    /// Conversation kind.
    pub message_type: MessageType,
    /// Session id (see [`MessageOrigin`]).
    pub session_id: String,
    /// Id of the bot account that received the message.
    pub self_id: String,
    /// Who sent the message.
    pub sender: Sender,
    /// Group id, for group messages.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Platform message id.
    #[serde(default)]
    pub message_id: String,
    /// The message content.
    pub message: MessageChain,
    /// Plain text of the message with leading and trailing whitespace removed.
    pub message_str: String,
}

impl MessageEvent {
    /// Builds an event from its segments, deriving `message_str`.
    pub fn new(
        platform: PlatformMeta,
        message_type: MessageType,
        session_id: impl Into<String>,
        self_id: impl Into<String>,
        sender: Sender,
        message: MessageChain,
    ) -> Self {
        let message_str = message.plain_text().trim().to_string();
        Self {
            platform,
            message_type,
            session_id: session_id.into(),
            self_id: self_id.into(),
            sender,
            group_id: None,
            message_id: String::new(),
            message,
            message_str,
        }
    }

    /// Sets the group id (builder style).
    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Returns the unified origin of this event.
    pub fn origin(&self) -> MessageOrigin {
        MessageOrigin::new(&self.platform.id, self.message_type, &self.session_id)
    }

    /// Returns `true` when the sender is the bot itself.
    pub fn is_from_self(&self) -> bool {
        !self.self_id.is_empty() && self.sender.user_id == self.self_id
    }

    /// Returns `true` for one-to-one conversations.
    pub fn is_private(&self) -> bool {
        self.message_type == MessageType::FriendMessage
    }

    /// Returns the first segment of the message, ignoring leading reply quotes.
    pub fn leading_segment(&self) -> Option<&MessageSegment> {
        self.message
            .iter()
            .find(|seg| !matches!(seg, MessageSegment::Reply { .. }))
    }
}

// ============================================================================
// Handler Event Types
// ============================================================================

/// The event a handler is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A message arrived from a platform adapter.
    AdapterMessage,
    /// An LLM request is about to be sent; handlers may edit it.
    OnLlmRequest,
    /// An LLM response came back.
    OnLlmResponse,
    /// The event result is about to be decorated before sending.
    OnDecoratingResult,
    /// The event result has been sent.
    OnAfterMessageSent,
    /// A function tool is about to be called.
    OnCallingFuncTool,
    /// A function tool returned.
    OnLlmToolRespond,
    /// The framework finished loading (bootstrap).
    OnLoaded,
    /// A platform adapter finished loading (bootstrap).
    OnPlatformLoaded,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [EventType; 9] = [
        Self::AdapterMessage,
        Self::OnLlmRequest,
        Self::OnLlmResponse,
        Self::OnDecoratingResult,
        Self::OnAfterMessageSent,
        Self::OnCallingFuncTool,
        Self::OnLlmToolRespond,
        Self::OnLoaded,
        Self::OnPlatformLoaded,
    ];

    /// Returns the snake_case name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdapterMessage => "adapter_message",
            Self::OnLlmRequest => "on_llm_request",
            Self::OnLlmResponse => "on_llm_response",
            Self::OnDecoratingResult => "on_decorating_result",
            Self::OnAfterMessageSent => "on_after_message_sent",
            Self::OnCallingFuncTool => "on_calling_func_tool",
            Self::OnLlmToolRespond => "on_llm_tool_respond",
            Self::OnLoaded => "on_loaded",
            Self::OnPlatformLoaded => "on_platform_loaded",
        }
    }

    /// Bootstrap events bypass plugin allowlists.
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, Self::OnLoaded | Self::OnPlatformLoaded)
    }

    /// Returns the pipeline stages this event type appears in.
    ///
    /// `AdapterMessage` appears at [`Stage::Waking`] as trigger metadata and at
    /// [`Stage::Process`] where its handlers actually run. Bootstrap events are
    /// outside the message pipeline and map to no stage.
    pub fn stages(&self) -> &'static [Stage] {
        match self {
            Self::AdapterMessage => &[Stage::Waking, Stage::Process],
            Self::OnLlmRequest
            | Self::OnLlmResponse
            | Self::OnCallingFuncTool
            | Self::OnLlmToolRespond => &[Stage::Process],
            Self::OnDecoratingResult => &[Stage::ResultDecorate],
            Self::OnAfterMessageSent => &[Stage::Respond],
            Self::OnLoaded | Self::OnPlatformLoaded => &[],
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEventType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str) -> MessageEvent {
        MessageEvent::new(
            PlatformMeta {
                name: "onebot".into(),
                id: "qq".into(),
            },
            MessageType::GroupMessage,
            "9000",
            "10000",
            Sender {
                user_id: "123".into(),
                nickname: None,
            },
            MessageChain::new().text(text),
        )
    }

    #[test]
    fn test_origin_round_trip() {
        let origin: MessageOrigin = "qq:GroupMessage:9000".parse().unwrap();
        assert_eq!(origin.platform_id, "qq");
        assert_eq!(origin.message_type, MessageType::GroupMessage);
        assert_eq!(origin.session_id, "9000");
        assert_eq!(origin.to_string(), "qq:GroupMessage:9000");
    }

    #[test]
    fn test_origin_session_may_contain_colons() {
        let origin: MessageOrigin = "tg:FriendMessage:a:b:c".parse().unwrap();
        assert_eq!(origin.session_id, "a:b:c");
    }

    #[test]
    fn test_origin_rejects_malformed() {
        assert!("qq:GroupMessage".parse::<MessageOrigin>().is_err());
        assert!("qq:Nope:1".parse::<MessageOrigin>().is_err());
        assert!(":GroupMessage:1".parse::<MessageOrigin>().is_err());
    }

    #[test]
    fn test_message_str_is_trimmed() {
        let ev = event("  /help  ");
        assert_eq!(ev.message_str, "/help");
        assert_eq!(ev.origin().to_string(), "qq:GroupMessage:9000");
        assert!(!ev.is_from_self());
    }

    #[test]
    fn test_adapter_message_spans_two_stages() {
        assert_eq!(
            EventType::AdapterMessage.stages(),
            &[Stage::Waking, Stage::Process]
        );
        assert!(EventType::OnLoaded.stages().is_empty());
        assert!(EventType::OnPlatformLoaded.is_bootstrap());
        assert_eq!(
            "on_llm_request".parse::<EventType>().unwrap(),
            EventType::OnLlmRequest
        );
    }
}
