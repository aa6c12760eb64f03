//! Command and command-group filters.
//!
//! A command is addressed by its signature: the command name, prefixed by the
//! signatures of every enclosing group (`"admin ban"`). Each name and alias
//! along the chain contributes, so a command `ban` (alias `b`) under group
//! `admin` (alias `a`) answers to `admin ban`, `admin b`, `a ban` and `a b`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::WakeConfig;
use crate::context::EventContext;
use crate::error::{FilterError, ParamError};

use super::basic::CustomFilter;
use super::params::{ParamSchema, ParamSpec, ParamValue};

/// Command names and aliases, as seen by conflict detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Canonical signature.
    pub name: String,
    /// Every other signature the command answers to.
    pub aliases: Vec<String>,
    /// `true` for command groups.
    pub group: bool,
}

impl CommandSpec {
    /// Canonical signature followed by the aliases.
    pub fn all_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// A successful literal match against the message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMatch {
    /// Length of the matched signature in bytes.
    pub len: usize,
    /// The matched signature.
    pub signature: String,
    /// Text after the signature, trimmed.
    pub rest: String,
}

/// Collapses runs of whitespace and trims, the form signatures are matched against.
pub fn normalize_command_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn compose(parent: Option<&CommandGroupFilter>, own: &[&str]) -> Vec<String> {
    match parent {
        None => own.iter().map(|n| n.to_string()).collect(),
        Some(parent) => parent
            .signatures()
            .into_iter()
            .flat_map(|p| own.iter().map(move |n| format!("{p} {n}")))
            .collect(),
    }
}

fn longest_match(signatures: &[String], text: &str) -> Option<CommandMatch> {
    signatures
        .iter()
        .filter_map(|sig| {
            let rest = text.strip_prefix(sig.as_str())?;
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                Some(CommandMatch {
                    len: sig.len(),
                    signature: sig.clone(),
                    rest: rest.trim().to_string(),
                })
            } else {
                None
            }
        })
        .fold(None, |best: Option<CommandMatch>, m| match best {
            Some(b) if b.len >= m.len => Some(b),
            _ => Some(m),
        })
}

fn custom_filters_pass(
    filters: &[CustomFilter],
    ctx: &EventContext,
    config: &WakeConfig,
) -> Result<bool, FilterError> {
    for filter in filters {
        if !filter.matches(ctx, config)? {
            return Ok(false);
        }
    }
    Ok(true)
}

// =============================================================================
// CommandGroupFilter
// =============================================================================

/// A named group of commands; groups may nest.
#[derive(Debug, Clone)]
pub struct CommandGroupFilter {
    name: String,
    aliases: BTreeSet<String>,
    parent: Option<Box<CommandGroupFilter>>,
    custom_filters: Vec<CustomFilter>,
}

impl CommandGroupFilter {
    /// Creates a top-level group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: BTreeSet::new(),
            parent: None,
            custom_filters: Vec::new(),
        }
    }

    /// Adds an alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.insert(alias.into());
        self
    }

    /// Nests this group under `parent`.
    pub fn under(mut self, parent: CommandGroupFilter) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Adds a pre-filter that must pass before the group is considered.
    pub fn with_custom(mut self, filter: CustomFilter) -> Self {
        self.custom_filters.push(filter);
        self
    }

    /// The group's own name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical signature, parent-first.
    pub fn canonical(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{} {}", parent.canonical(), self.name),
            None => self.name.clone(),
        }
    }

    /// Every signature the group answers to, canonical first.
    pub fn signatures(&self) -> Vec<String> {
        let own: Vec<&str> = std::iter::once(self.name.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .collect();
        compose(self.parent.as_deref(), &own)
    }

    /// Longest signature matching `text` (already normalized).
    pub fn longest_match(&self, text: &str) -> Option<CommandMatch> {
        longest_match(&self.signatures(), text)
    }

    /// Runs the group's pre-filters.
    pub fn pre_filters_pass(
        &self,
        ctx: &EventContext,
        config: &WakeConfig,
    ) -> Result<bool, FilterError> {
        custom_filters_pass(&self.custom_filters, ctx, config)
    }

    /// Names and aliases for conflict detection.
    pub fn spec(&self) -> CommandSpec {
        spec_from(self.signatures(), true)
    }

    /// Matches when the event is a wake command addressed to this group.
    pub fn matches(&self, ctx: &EventContext, config: &WakeConfig) -> Result<bool, FilterError> {
        if !ctx.is_at_or_wake_command() {
            return Ok(false);
        }
        let text = normalize_command_text(&ctx.message_str());
        Ok(self.longest_match(&text).is_some() && self.pre_filters_pass(ctx, config)?)
    }
}

// =============================================================================
// CommandFilter
// =============================================================================

/// A literal command with typed parameters.
#[derive(Debug, Clone)]
pub struct CommandFilter {
    name: String,
    aliases: BTreeSet<String>,
    parent: Option<CommandGroupFilter>,
    params: ParamSchema,
    strict: bool,
    custom_filters: Vec<CustomFilter>,
}

impl CommandFilter {
    /// Creates a top-level command.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: BTreeSet::new(),
            parent: None,
            params: ParamSchema::new(),
            strict: false,
            custom_filters: Vec::new(),
        }
    }

    /// Adds an alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.insert(alias.into());
        self
    }

    /// Places the command inside `group`.
    pub fn under(mut self, group: CommandGroupFilter) -> Self {
        self.parent = Some(group);
        self
    }

    /// Rejects arguments beyond the declared parameters.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Declares the next parameter.
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Adds a pre-filter that must pass before the command is considered.
    pub fn with_custom(mut self, filter: CustomFilter) -> Self {
        self.custom_filters.push(filter);
        self
    }

    /// The command's own name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameters.
    pub fn params(&self) -> &ParamSchema {
        &self.params
    }

    /// Canonical signature, parent-first.
    pub fn canonical(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{} {}", parent.canonical(), self.name),
            None => self.name.clone(),
        }
    }

    /// Every signature the command answers to, canonical first.
    pub fn signatures(&self) -> Vec<String> {
        let own: Vec<&str> = std::iter::once(self.name.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .collect();
        compose(self.parent.as_ref(), &own)
    }

    /// Longest signature matching `text` (already normalized).
    pub fn longest_match(&self, text: &str) -> Option<CommandMatch> {
        longest_match(&self.signatures(), text)
    }

    /// Converts the text after the signature into parameters.
    pub fn parse_params(&self, rest: &str) -> Result<Vec<ParamValue>, ParamError> {
        if self.strict {
            self.params.parse_strict(rest)
        } else {
            self.params.parse(rest)
        }
    }

    /// Runs the command's pre-filters, including those of enclosing groups.
    pub fn pre_filters_pass(
        &self,
        ctx: &EventContext,
        config: &WakeConfig,
    ) -> Result<bool, FilterError> {
        if let Some(parent) = &self.parent {
            if !parent.pre_filters_pass(ctx, config)? {
                return Ok(false);
            }
        }
        custom_filters_pass(&self.custom_filters, ctx, config)
    }

    /// Names and aliases for conflict detection.
    pub fn spec(&self) -> CommandSpec {
        spec_from(self.signatures(), false)
    }

    /// Matches a wake command addressed to this command with valid arguments.
    pub fn matches(&self, ctx: &EventContext, config: &WakeConfig) -> Result<bool, FilterError> {
        if !ctx.is_at_or_wake_command() {
            return Ok(false);
        }
        let text = normalize_command_text(&ctx.message_str());
        let Some(m) = self.longest_match(&text) else {
            return Ok(false);
        };
        Ok(self.parse_params(&m.rest).is_ok() && self.pre_filters_pass(ctx, config)?)
    }
}

fn spec_from(mut signatures: Vec<String>, group: bool) -> CommandSpec {
    let name = if signatures.is_empty() {
        String::new()
    } else {
        signatures.remove(0)
    };
    CommandSpec {
        name,
        aliases: signatures,
        group,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ParamKind;

    #[test]
    fn test_signatures_compose_parent_first() {
        let admin = CommandGroupFilter::new("admin").alias("a");
        let ban = CommandFilter::new("ban").alias("b").under(admin);
        assert_eq!(ban.canonical(), "admin ban");
        assert_eq!(
            ban.signatures(),
            vec!["admin ban", "admin b", "a ban", "a b"]
        );

        let spec = ban.spec();
        assert_eq!(spec.name, "admin ban");
        assert_eq!(spec.aliases.len(), 3);
        assert!(!spec.group);
    }

    #[test]
    fn test_nested_groups() {
        let outer = CommandGroupFilter::new("cfg");
        let inner = CommandGroupFilter::new("llm").under(outer);
        let set = CommandFilter::new("set").under(inner.clone());
        assert_eq!(inner.canonical(), "cfg llm");
        assert_eq!(set.canonical(), "cfg llm set");
    }

    #[test]
    fn test_match_requires_word_boundary() {
        let cmd = CommandFilter::new("help");
        assert!(cmd.longest_match("help").is_some());
        assert_eq!(cmd.longest_match("help me").unwrap().rest, "me");
        assert!(cmd.longest_match("helpme").is_none());
        assert!(cmd.longest_match("xhelp").is_none());
    }

    #[test]
    fn test_longest_signature_wins_within_one_command() {
        let cmd = CommandFilter::new("a").alias("a b");
        let m = cmd.longest_match("a b c").unwrap();
        assert_eq!(m.signature, "a b");
        assert_eq!(m.rest, "c");
    }

    #[test]
    fn test_parse_params() {
        let cmd = CommandFilter::new("ban").param(ParamSpec::required("user", ParamKind::Int));
        assert_eq!(cmd.parse_params("123").unwrap(), vec![ParamValue::Int(123)]);
        assert!(cmd.parse_params("bob").is_err());
        assert_eq!(cmd.parse_params("123 spam").unwrap(), vec![ParamValue::Int(123)]);

        let strict = CommandFilter::new("ping").strict();
        assert!(strict.parse_params("").is_ok());
        assert!(strict.parse_params("hello").is_err());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_command_text("  a   b\tc "), "a b c");
    }
}
