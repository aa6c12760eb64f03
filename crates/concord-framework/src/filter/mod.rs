//! Filters attached to handlers.
//!
//! Every [`Filter`] is one boolean predicate over an [`EventContext`] and the
//! global [`WakeConfig`]. Command and command-group filters additionally
//! expose their signatures, aliases and parameter schema so the wake stage can
//! run longest-match resolution across all commands at once.

mod basic;
mod command;
mod params;
mod permission;

pub use basic::{AdapterTypeFilter, CustomFilter, EventMessageTypeFilter, RegexFilter};
pub use command::{
    CommandFilter, CommandGroupFilter, CommandMatch, CommandSpec, normalize_command_text,
};
pub use params::{ParamKind, ParamSchema, ParamSpec, ParamValue};
pub use permission::{PermissionFilter, PermissionType};

use crate::config::WakeConfig;
use crate::context::EventContext;
use crate::error::FilterError;

/// A predicate attached to a handler.
#[derive(Debug, Clone)]
pub enum Filter {
    /// A literal command.
    Command(CommandFilter),
    /// A command group.
    CommandGroup(CommandGroupFilter),
    /// A regular expression over the message text.
    Regex(RegexFilter),
    /// Conversation kind restriction.
    EventMessageType(EventMessageTypeFilter),
    /// Platform adapter restriction.
    AdapterType(AdapterTypeFilter),
    /// Sender role requirement.
    Permission(PermissionFilter),
    /// Plugin-supplied predicate.
    Custom(CustomFilter),
}

impl Filter {
    /// A short label for logs and diagnostics.
    pub fn label(&self) -> String {
        match self {
            Self::Command(c) => format!("command:{}", c.canonical()),
            Self::CommandGroup(g) => format!("command_group:{}", g.canonical()),
            Self::Regex(r) => format!("regex:{}", r.pattern()),
            Self::EventMessageType(_) => "event_message_type".to_string(),
            Self::AdapterType(_) => "adapter_type".to_string(),
            Self::Permission(_) => "permission".to_string(),
            Self::Custom(c) => format!("custom:{}", c.name()),
        }
    }

    /// Returns `true` for command and command-group filters.
    pub fn is_command(&self) -> bool {
        matches!(self, Self::Command(_) | Self::CommandGroup(_))
    }

    /// Returns `true` for permission filters.
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::Permission(_))
    }

    /// Names and aliases, for command-like filters.
    pub fn command_spec(&self) -> Option<CommandSpec> {
        match self {
            Self::Command(c) => Some(c.spec()),
            Self::CommandGroup(g) => Some(g.spec()),
            _ => None,
        }
    }

    /// Evaluates the filter.
    pub fn matches(&self, ctx: &EventContext, config: &WakeConfig) -> Result<bool, FilterError> {
        match self {
            Self::Command(c) => c.matches(ctx, config),
            Self::CommandGroup(g) => g.matches(ctx, config),
            Self::Regex(r) => Ok(r.matches(ctx)),
            Self::EventMessageType(t) => Ok(t.matches(ctx)),
            Self::AdapterType(a) => Ok(a.matches(ctx)),
            Self::Permission(p) => p.matches(ctx),
            Self::Custom(c) => c.matches(ctx, config),
        }
    }
}

macro_rules! impl_from_filter {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Filter {
                fn from(f: $ty) -> Self {
                    Self::$variant(f)
                }
            }
        )*
    };
}

impl_from_filter! {
    CommandFilter => Command,
    CommandGroupFilter => CommandGroup,
    RegexFilter => Regex,
    EventMessageTypeFilter => EventMessageType,
    AdapterTypeFilter => AdapterType,
    PermissionFilter => Permission,
    CustomFilter => Custom,
}
