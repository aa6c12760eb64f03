//! Permission filters.

use serde::{Deserialize, Serialize};

use crate::context::EventContext;
use crate::error::FilterError;

/// The role a handler requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionType {
    /// Only configured admins.
    Admin,
    /// Anyone.
    Member,
}

/// Requires a role of the sender.
///
/// On denial the handler is silently skipped, unless `raise_on_deny` is set,
/// in which case evaluation fails with [`FilterError::PermissionDenied`] and
/// the wake stage terminates the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionFilter {
    /// The required role.
    pub required: PermissionType,
    /// Fail instead of skipping on denial.
    pub raise_on_deny: bool,
}

impl PermissionFilter {
    /// Admin-only, skipping silently on denial.
    pub fn admin() -> Self {
        Self {
            required: PermissionType::Admin,
            raise_on_deny: false,
        }
    }

    /// Open to everyone.
    pub fn member() -> Self {
        Self {
            required: PermissionType::Member,
            raise_on_deny: false,
        }
    }

    /// Fails loudly on denial (builder style).
    pub fn raising(mut self) -> Self {
        self.raise_on_deny = true;
        self
    }

    pub(crate) fn matches(&self, ctx: &EventContext) -> Result<bool, FilterError> {
        if self.required == PermissionType::Member || ctx.is_admin() {
            return Ok(true);
        }
        if self.raise_on_deny {
            Err(FilterError::PermissionDenied {
                sender_id: ctx.sender_id().to_string(),
            })
        } else {
            Ok(false)
        }
    }
}
