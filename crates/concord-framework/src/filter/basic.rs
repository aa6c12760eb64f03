//! Regex, message-type, adapter-type and custom filters.

use std::sync::Arc;

use regex::Regex;

use concord_core::MessageType;

use crate::config::WakeConfig;
use crate::context::EventContext;
use crate::error::FilterError;

/// Matches the (prefix-stripped) message text against a regular expression.
#[derive(Debug, Clone)]
pub struct RegexFilter {
    regex: Regex,
}

impl RegexFilter {
    /// Compiles `pattern`.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    /// The source pattern.
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub(crate) fn matches(&self, ctx: &EventContext) -> bool {
        self.regex.is_match(&ctx.message_str())
    }
}

/// Restricts a handler to some conversation kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessageTypeFilter {
    types: Vec<MessageType>,
}

impl EventMessageTypeFilter {
    /// Accepts any of `types`.
    pub fn new(types: impl IntoIterator<Item = MessageType>) -> Self {
        Self {
            types: types.into_iter().collect(),
        }
    }

    /// Accepts private chats only.
    pub fn private_only() -> Self {
        Self::new([MessageType::FriendMessage])
    }

    /// Accepts group chats only.
    pub fn group_only() -> Self {
        Self::new([MessageType::GroupMessage])
    }

    pub(crate) fn matches(&self, ctx: &EventContext) -> bool {
        self.types.contains(&ctx.event().message_type)
    }
}

/// Restricts a handler to some platform adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterTypeFilter {
    adapters: Vec<String>,
}

impl AdapterTypeFilter {
    /// Accepts events from any adapter named in `adapters`.
    pub fn new<S: Into<String>>(adapters: impl IntoIterator<Item = S>) -> Self {
        Self {
            adapters: adapters.into_iter().map(Into::into).collect(),
        }
    }

    pub(crate) fn matches(&self, ctx: &EventContext) -> bool {
        let name = &ctx.event().platform.name;
        self.adapters.iter().any(|a| a == name)
    }
}

type Predicate = dyn Fn(&EventContext, &WakeConfig) -> Result<bool, FilterError> + Send + Sync;

/// A plugin-supplied predicate.
#[derive(Clone)]
pub struct CustomFilter {
    name: String,
    predicate: Arc<Predicate>,
}

impl CustomFilter {
    /// Wraps `predicate` under `name`.
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&EventContext, &WakeConfig) -> Result<bool, FilterError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// The filter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluates the predicate.
    pub fn matches(&self, ctx: &EventContext, config: &WakeConfig) -> Result<bool, FilterError> {
        (self.predicate)(ctx, config)
    }
}

impl std::fmt::Debug for CustomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomFilter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
