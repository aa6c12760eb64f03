//! Message types for the Concord framework.
//!
//! Adapters translate their wire formats into [`MessageSegment`]s; everything
//! past the adapter boundary (wake detection, command matching, result
//! decoration) only ever sees this platform-agnostic representation.

use std::fmt;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

// ============================================================================
// Message Segment
// ============================================================================

/// A single unit of message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageSegment {
    /// Plain text content.
    Plain {
        /// The text.
        text: String,
    },
    /// A mention of a single user.
    At {
        /// The mentioned user id.
        target: String,
        /// Display name, when the platform provides one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// A mention of every member of the group.
    AtAll,
    /// A reference to an earlier message.
    Reply {
        /// Id of the quoted message.
        message_id: String,
        /// Sender of the quoted message.
        sender_id: String,
    },
    /// An image, identified by a platform-specific reference.
    Image {
        /// URL, file path or other platform reference.
        url: String,
    },
}

impl MessageSegment {
    /// Creates a plain text segment.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Plain { text: text.into() }
    }

    /// Creates a mention segment.
    pub fn at(target: impl Into<String>) -> Self {
        Self::At {
            target: target.into(),
            name: None,
        }
    }

    /// Returns the type identifier of this segment.
    pub fn segment_type(&self) -> &'static str {
        match self {
            Self::Plain { .. } => "plain",
            Self::At { .. } => "at",
            Self::AtAll => "at_all",
            Self::Reply { .. } => "reply",
            Self::Image { .. } => "image",
        }
    }

    /// Returns the text content if this is a plain segment.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Plain { text } => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for MessageSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain { text } => f.write_str(text),
            Self::At { target, .. } => write!(f, "[At:{target}]"),
            Self::AtAll => f.write_str("[At:all]"),
            Self::Reply { message_id, .. } => write!(f, "[Reply:{message_id}]"),
            Self::Image { .. } => f.write_str("[Image]"),
        }
    }
}

// ============================================================================
// Message Chain
// ============================================================================

/// An ordered sequence of [`MessageSegment`]s forming one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageChain(Vec<MessageSegment>);

impl MessageChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a plain text segment (builder style).
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.0.push(MessageSegment::text(text));
        self
    }

    /// Appends a mention segment (builder style).
    pub fn at(mut self, target: impl Into<String>) -> Self {
        self.0.push(MessageSegment::at(target));
        self
    }

    /// Concatenates the text of all plain segments.
    pub fn plain_text(&self) -> String {
        self.0.iter().filter_map(MessageSegment::as_text).collect()
    }

    /// Returns the segments as a slice.
    pub fn segments(&self) -> &[MessageSegment] {
        &self.0
    }

    /// Consumes the chain, returning the segments.
    pub fn into_segments(self) -> Vec<MessageSegment> {
        self.0
    }
}

impl From<Vec<MessageSegment>> for MessageChain {
    fn from(segments: Vec<MessageSegment>) -> Self {
        Self(segments)
    }
}

impl FromIterator<MessageSegment> for MessageChain {
    fn from_iter<I: IntoIterator<Item = MessageSegment>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Deref for MessageChain {
    type Target = Vec<MessageSegment>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MessageChain {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Display for MessageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.0 {
            write!(f, "{seg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_skips_rich_segments() {
        let chain = MessageChain::new().at("42").text("hello ").text("world");
        assert_eq!(chain.plain_text(), "hello world");
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_segment_serde_tagging() {
        let seg = MessageSegment::at("10001");
        let json = serde_json::to_value(&seg).unwrap();
        assert_eq!(json["type"], "at");
        assert_eq!(json["target"], "10001");
        let back: MessageSegment = serde_json::from_value(json).unwrap();
        assert_eq!(back, seg);
    }
}
