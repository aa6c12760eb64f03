//! Per-session plugin enablement.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use concord_core::MessageOrigin;

use crate::handler::HandlerDescriptor;
use crate::registry::HandlerRegistry;

/// Resolves which plugins are enabled in a given session.
#[async_trait]
pub trait SessionPluginFilter: Send + Sync {
    /// Returns `true` if `plugin_name` is enabled for `origin`.
    async fn is_enabled_for_session(&self, origin: &MessageOrigin, plugin_name: &str) -> bool;

    /// Drops handlers whose plugin is disabled for `origin`. Reserved plugins
    /// are never dropped.
    async fn filter_by_session(
        &self,
        origin: &MessageOrigin,
        handlers: Vec<Arc<HandlerDescriptor>>,
        registry: &HandlerRegistry,
    ) -> Vec<Arc<HandlerDescriptor>> {
        let mut kept = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let keep = match registry.plugin(&handler.module_path) {
                Some(plugin) if plugin.reserved => true,
                Some(plugin) => self.is_enabled_for_session(origin, &plugin.name).await,
                None => {
                    self.is_enabled_for_session(origin, &handler.module_path)
                        .await
                }
            };
            if keep {
                kept.push(handler);
            }
        }
        kept
    }
}

/// Every plugin is enabled everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllSessions;

#[async_trait]
impl SessionPluginFilter for AllowAllSessions {
    async fn is_enabled_for_session(&self, _: &MessageOrigin, _: &str) -> bool {
        true
    }
}

/// An in-memory table of plugins disabled per session.
#[derive(Debug, Default)]
pub struct StaticSessionFilter {
    disabled: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticSessionFilter {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Disables `plugin_name` in `origin`.
    pub fn disable(&self, origin: &MessageOrigin, plugin_name: impl Into<String>) {
        self.disabled
            .write()
            .entry(origin.to_string())
            .or_default()
            .insert(plugin_name.into());
    }

    /// Re-enables `plugin_name` in `origin`.
    pub fn enable(&self, origin: &MessageOrigin, plugin_name: &str) {
        if let Some(set) = self.disabled.write().get_mut(&origin.to_string()) {
            set.remove(plugin_name);
        }
    }
}

#[async_trait]
impl SessionPluginFilter for StaticSessionFilter {
    async fn is_enabled_for_session(&self, origin: &MessageOrigin, plugin_name: &str) -> bool {
        self.disabled
            .read()
            .get(&origin.to_string())
            .is_none_or(|set| !set.contains(plugin_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerResult;
    use crate::handler::{HandlerCall, into_handler};
    use crate::plugin::PluginMetadata;
    use concord_core::{EventType, MessageType};

    async fn noop(_: HandlerCall) -> HandlerResult {
        Ok(())
    }

    #[tokio::test]
    async fn test_static_filter_keeps_reserved() {
        let origin = MessageOrigin::new("qq", MessageType::GroupMessage, "1");
        let filter = StaticSessionFilter::new();
        filter.disable(&origin, "music");
        filter.disable(&origin, "core");

        let mut reg = HandlerRegistry::new();
        reg.register_plugin(PluginMetadata::new("music", "music"));
        reg.register_plugin(PluginMetadata::new("core", "core").reserved());
        reg.register(HandlerDescriptor::new(EventType::AdapterMessage, "music", "play", into_handler(noop)));
        reg.register(HandlerDescriptor::new(EventType::AdapterMessage, "core", "help", into_handler(noop)));

        let kept = filter
            .filter_by_session(&origin, reg.handlers().to_vec(), &reg)
            .await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].full_name, "core_help");

        filter.enable(&origin, "music");
        assert!(filter.is_enabled_for_session(&origin, "music").await);
    }
}
