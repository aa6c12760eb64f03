//! The handler registry.
//!
//! [`HandlerRegistry`] keeps every registered [`HandlerDescriptor`] in one
//! list ordered by descending priority; ties keep insertion order. Plugin
//! metadata and function tools live alongside so that allowlist checks and
//! owner-scoped removal need no second lookup.
//!
//! [`SharedRegistry`] wraps a registry for concurrent use: readers take an
//! `Arc` snapshot that never changes under them, writers run one at a time
//! and publish a fresh copy when done.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use concord_core::EventType;

use crate::handler::HandlerDescriptor;
use crate::plugin::{PluginMetadata, ToolDescriptor};

// =============================================================================
// HandlerRegistry
// =============================================================================

/// Priority-ordered store of handlers, plugins and tools.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<HandlerDescriptor>>,
    by_name: HashMap<String, Arc<HandlerDescriptor>>,
    plugins: HashMap<String, PluginMetadata>,
    tools: Vec<ToolDescriptor>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Handlers ────────────────────────────────────────────────────────────

    /// Registers a handler and restores priority order.
    ///
    /// A handler whose full name is already registered replaces the old one
    /// and takes its place at the end of its priority band.
    pub fn register(&mut self, mut handler: HandlerDescriptor) -> Arc<HandlerDescriptor> {
        if !handler.extras.get("priority").is_some_and(|p| p.is_i64()) {
            handler.set_priority(0);
        }
        if self.remove(&handler.full_name).is_some() {
            warn!(
                handler = %handler.full_name,
                "Handler registered twice, replacing the previous registration"
            );
        }

        let handler = Arc::new(handler);
        self.by_name
            .insert(handler.full_name.clone(), Arc::clone(&handler));
        self.handlers.push(Arc::clone(&handler));
        // Stable: equal priorities keep their insertion order.
        self.handlers
            .sort_by(|a, b| b.priority().cmp(&a.priority()));

        debug!(
            handler = %handler.full_name,
            event_type = %handler.event_type,
            priority = handler.priority(),
            "Registered handler"
        );
        handler
    }

    /// Returns handlers for `event_type` in registry order.
    ///
    /// `only_activated` drops disabled handlers and handlers of deactivated
    /// plugins. `plugins_name` restricts results to the listed plugins;
    /// `None` or a list containing `"*"` admits all. Handlers of reserved
    /// plugins and handlers of bootstrap events always pass the allowlist.
    pub fn get(
        &self,
        event_type: EventType,
        only_activated: bool,
        plugins_name: Option<&[String]>,
    ) -> Vec<Arc<HandlerDescriptor>> {
        let allowlist = plugins_name.filter(|names| !names.iter().any(|n| n == "*"));

        self.handlers
            .iter()
            .filter(|h| h.event_type == event_type)
            .filter(|h| {
                if !only_activated {
                    return true;
                }
                h.enabled
                    && self
                        .plugins
                        .get(&h.module_path)
                        .is_none_or(|p| p.activated)
            })
            .filter(|h| {
                let Some(names) = allowlist else {
                    return true;
                };
                if event_type.is_bootstrap() {
                    return true;
                }
                match self.plugins.get(&h.module_path) {
                    Some(plugin) => plugin.reserved || names.contains(&plugin.name),
                    None => names.contains(&h.module_path),
                }
            })
            .cloned()
            .collect()
    }

    /// Looks up a handler by full name.
    pub fn lookup(&self, full_name: &str) -> Option<&Arc<HandlerDescriptor>> {
        self.by_name.get(full_name)
    }

    /// Returns every handler owned by `module_path`, in registry order.
    pub fn list_by_owner(&self, module_path: &str) -> Vec<Arc<HandlerDescriptor>> {
        self.handlers
            .iter()
            .filter(|h| h.module_path == module_path)
            .cloned()
            .collect()
    }

    /// Removes a handler by full name.
    pub fn remove(&mut self, full_name: &str) -> Option<Arc<HandlerDescriptor>> {
        let removed = self.by_name.remove(full_name)?;
        self.handlers.retain(|h| h.full_name != full_name);
        Some(removed)
    }

    /// Removes every handler, plugin and tool.
    pub fn clear(&mut self) {
        self.handlers.clear();
        self.by_name.clear();
        self.plugins.clear();
        self.tools.clear();
    }

    /// All handlers in registry order.
    pub fn handlers(&self) -> &[Arc<HandlerDescriptor>] {
        &self.handlers
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` when no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    // ─── Plugins ─────────────────────────────────────────────────────────────

    /// Records plugin metadata, replacing any earlier entry for the module.
    pub fn register_plugin(&mut self, metadata: PluginMetadata) {
        self.plugins.insert(metadata.module_path.clone(), metadata);
    }

    /// Removes a plugin together with its handlers and tools.
    ///
    /// Returns the number of handlers removed.
    pub fn remove_plugin(&mut self, module_path: &str) -> usize {
        self.plugins.remove(module_path);
        self.tools.retain(|t| t.owner != module_path);
        let before = self.handlers.len();
        self.handlers.retain(|h| h.module_path != module_path);
        self.by_name.retain(|_, h| h.module_path != module_path);
        before - self.handlers.len()
    }

    /// Metadata of the plugin owning `module_path`.
    pub fn plugin(&self, module_path: &str) -> Option<&PluginMetadata> {
        self.plugins.get(module_path)
    }

    /// Every registered plugin, sorted by module id.
    pub fn plugins(&self) -> Vec<&PluginMetadata> {
        let mut plugins: Vec<_> = self.plugins.values().collect();
        plugins.sort_by(|a, b| a.module_path.cmp(&b.module_path));
        plugins
    }

    /// Display label of the plugin owning `module_path`.
    pub fn plugin_label<'a>(&'a self, module_path: &'a str) -> &'a str {
        self.plugins
            .get(module_path)
            .map(PluginMetadata::label)
            .unwrap_or(module_path)
    }

    // ─── Tools ───────────────────────────────────────────────────────────────

    /// Registers a function tool.
    pub fn register_tool(&mut self, tool: ToolDescriptor) {
        self.tools.push(tool);
    }

    /// All registered tools.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }
}

// =============================================================================
// SharedRegistry
// =============================================================================

/// A copy-on-write registry shared between dispatch and plugin management.
#[derive(Debug, Default)]
pub struct SharedRegistry {
    current: RwLock<Arc<HandlerRegistry>>,
    writer: AsyncMutex<()>,
}

impl SharedRegistry {
    /// Wraps `registry`.
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
            writer: AsyncMutex::new(()),
        }
    }

    /// Returns the current consistent snapshot.
    pub fn snapshot(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.current.read())
    }

    /// Applies `f` to a private copy inside the exclusive writer section and
    /// publishes the result atomically.
    pub async fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut HandlerRegistry) -> R,
    {
        let _guard = self.writer.lock().await;
        let mut next = HandlerRegistry::clone(&self.snapshot());
        let out = f(&mut next);
        *self.current.write() = Arc::new(next);
        out
    }
}
