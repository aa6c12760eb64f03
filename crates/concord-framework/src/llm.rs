//! The LLM request object handlers edit before it reaches a provider.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One turn of conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    /// `"user"`, `"assistant"` or `"system"`.
    pub role: String,
    /// Turn text.
    pub content: String,
}

impl ContextMessage {
    /// Creates a history turn.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Extra content appended to the user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Additional text.
    Text {
        /// The text.
        text: String,
    },
    /// An image reference.
    ImageUrl {
        /// The image URL.
        url: String,
    },
}

impl ContentPart {
    /// Creates a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Renders the part as text for previews.
    pub fn render(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::ImageUrl { url } => format!("[image: {url}]"),
        }
    }
}

/// A pending request to an LLM provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderRequest {
    /// The user prompt.
    pub prompt: String,
    /// The system prompt (persona text plus plugin injections).
    pub system_prompt: String,
    /// Conversation history.
    pub contexts: Vec<ContextMessage>,
    /// Extra content parts appended after the prompt.
    pub extra_user_content_parts: Vec<ContentPart>,
    /// Images attached to the prompt.
    pub image_urls: Vec<String>,
    /// Conversation id, when bound to one.
    pub session_id: Option<String>,
}

impl ProviderRequest {
    /// Creates a request for `prompt`.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Sets the system prompt (builder style).
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    /// Wraps the request for sharing across a handler chain.
    pub fn shared(self) -> SharedRequest {
        Arc::new(Mutex::new(self))
    }
}

/// A request shared by every handler of one `on_llm_request` chain.
pub type SharedRequest = Arc<Mutex<ProviderRequest>>;
