//! Wake & dispatch configuration.

use serde::{Deserialize, Serialize};

/// Global settings consulted by the wake stage and by filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Prefixes that wake the bot when a message starts with one of them.
    pub wake_prefix: Vec<String>,

    /// Sender ids tagged with the admin role.
    pub admins_id: Vec<String>,

    /// Drop messages the bot sent itself.
    pub ignore_bot_self_message: bool,

    /// Do not treat a mention of everyone as a wake mention.
    pub ignore_at_all: bool,

    /// Require a wake prefix even in private chats.
    pub friend_message_needs_wake_prefix: bool,

    /// Reply once to senders rejected by a raising permission filter.
    pub no_permission_reply: bool,

    /// Skip registration of built-in command handlers.
    pub disable_builtin_commands: bool,

    /// Plugin allowlist; empty or `"*"` admits every plugin.
    pub plugin_set: Vec<String>,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            wake_prefix: vec!["/".to_string()],
            admins_id: Vec::new(),
            ignore_bot_self_message: true,
            ignore_at_all: false,
            friend_message_needs_wake_prefix: false,
            no_permission_reply: true,
            disable_builtin_commands: false,
            plugin_set: vec!["*".to_string()],
        }
    }
}

impl WakeConfig {
    /// Returns `true` if `sender_id` is configured as an admin.
    pub fn is_admin(&self, sender_id: &str) -> bool {
        self.admins_id.iter().any(|id| id == sender_id)
    }

    /// Resolves the plugin allowlist. `None` means every plugin is allowed.
    pub fn plugin_allowlist(&self) -> Option<Vec<String>> {
        if self.plugin_set.is_empty() || self.plugin_set.iter().any(|p| p == "*") {
            None
        } else {
            Some(self.plugin_set.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_allowlist_is_none() {
        let cfg = WakeConfig::default();
        assert_eq!(cfg.plugin_allowlist(), None);

        let cfg = WakeConfig {
            plugin_set: vec!["weather".into(), "*".into()],
            ..Default::default()
        };
        assert_eq!(cfg.plugin_allowlist(), None);

        let cfg = WakeConfig {
            plugin_set: vec!["weather".into()],
            ..Default::default()
        };
        assert_eq!(cfg.plugin_allowlist(), Some(vec!["weather".to_string()]));
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let cfg: WakeConfig =
            serde_json::from_str(r#"{"admins_id": ["42"], "ignore_at_all": true}"#).unwrap();
        assert!(cfg.is_admin("42"));
        assert!(cfg.ignore_at_all);
        assert_eq!(cfg.wake_prefix, vec!["/"]);
        assert!(cfg.no_permission_reply);
    }
}
