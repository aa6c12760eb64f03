//! Handler descriptors.
//!
//! A [`HandlerDescriptor`] binds an async callback to one [`EventType`] and an
//! ordered list of [`Filter`]s. Descriptors are created when a plugin loads
//! and are owned by the [`HandlerRegistry`](crate::registry::HandlerRegistry)
//! until the plugin unloads.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use concord_core::{EventType, MessageEvent};

use crate::context::EventContext;
use crate::error::HandlerResult;
use crate::filter::{CommandSpec, Filter, ParamValue};
use crate::llm::SharedRequest;

// =============================================================================
// Handler callback
// =============================================================================

/// Everything a handler receives for one invocation.
#[derive(Clone)]
pub struct HandlerCall {
    /// The shared event context.
    pub ctx: Arc<EventContext>,
    /// The LLM request being built, for `on_llm_request` style hooks.
    pub request: Option<SharedRequest>,
    /// Parsed command parameters.
    pub params: Vec<ParamValue>,
}

impl HandlerCall {
    /// Creates a call without a request or parameters.
    pub fn new(ctx: Arc<EventContext>) -> Self {
        Self {
            ctx,
            request: None,
            params: Vec::new(),
        }
    }

    /// Returns the inbound event.
    pub fn event(&self) -> &MessageEvent {
        self.ctx.event()
    }

    /// Returns the `index`-th parsed parameter.
    pub fn param(&self, index: usize) -> Option<&ParamValue> {
        self.params.get(index)
    }
}

/// A type-erased async handler callback.
pub type HandlerFn = Arc<dyn Fn(HandlerCall) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Erases an async function into a [`HandlerFn`].
///
/// ```rust,ignore
/// async fn ping(call: HandlerCall) -> HandlerResult {
///     call.ctx.set_result(EventResult::text("pong"));
///     Ok(())
/// }
///
/// let handler = into_handler(ping);
/// ```
pub fn into_handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(HandlerCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |call| Box::pin(f(call)))
}

// =============================================================================
// Source reference
// =============================================================================

/// Where a handler's source text lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOrigin {
    /// A file on disk.
    File(PathBuf),
    /// Source text held in memory.
    Inline(Arc<str>),
}

/// Locates a handler's implementation for static analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    /// The source text.
    pub origin: SourceOrigin,
    /// Name of the handler function.
    pub function: String,
    /// The `impl` block the function lives in, for methods.
    pub impl_type: Option<String>,
}

impl SourceRef {
    /// References a free function in a file.
    pub fn file(path: impl Into<PathBuf>, function: impl Into<String>) -> Self {
        Self {
            origin: SourceOrigin::File(path.into()),
            function: function.into(),
            impl_type: None,
        }
    }

    /// References a free function in in-memory source.
    pub fn inline(source: impl Into<Arc<str>>, function: impl Into<String>) -> Self {
        Self {
            origin: SourceOrigin::Inline(source.into()),
            function: function.into(),
            impl_type: None,
        }
    }

    /// Restricts the lookup to methods of `impl_type`.
    pub fn in_impl(mut self, impl_type: impl Into<String>) -> Self {
        self.impl_type = Some(impl_type.into());
        self
    }
}

// =============================================================================
// Handler descriptor
// =============================================================================

/// A registered handler.
#[derive(Clone)]
pub struct HandlerDescriptor {
    /// Event the handler is bound to.
    pub event_type: EventType,
    /// Globally unique name, `"{module_path}_{handler_name}"`.
    pub full_name: String,
    /// Short name of the handler function.
    pub handler_name: String,
    /// Module id of the owning plugin.
    pub module_path: String,
    /// The callback.
    pub handler: HandlerFn,
    /// Filters, evaluated in order.
    pub filters: Vec<Filter>,
    /// Free-form description.
    pub desc: String,
    /// Extra attributes; `priority` is an integer, default 0.
    pub extras: Map<String, Value>,
    /// Disabled handlers are skipped by activated-only lookups.
    pub enabled: bool,
    /// Source location, for the static scanner.
    pub source: Option<SourceRef>,
}

impl HandlerDescriptor {
    /// Creates a descriptor with no filters and default priority.
    pub fn new(
        event_type: EventType,
        module_path: impl Into<String>,
        handler_name: impl Into<String>,
        handler: HandlerFn,
    ) -> Self {
        let module_path = module_path.into();
        let handler_name = handler_name.into();
        Self {
            event_type,
            full_name: format!("{module_path}_{handler_name}"),
            handler_name,
            module_path,
            handler,
            filters: Vec::new(),
            desc: String::new(),
            extras: Map::new(),
            enabled: true,
            source: None,
        }
    }

    /// Appends a filter.
    pub fn with_filter(mut self, filter: impl Into<Filter>) -> Self {
        self.filters.push(filter.into());
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.set_priority(priority);
        self
    }

    /// Sets the description.
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    /// Attaches a source reference.
    pub fn with_source(mut self, source: SourceRef) -> Self {
        self.source = Some(source);
        self
    }

    /// Marks the handler as disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Returns the priority, 0 when unset or not an integer.
    pub fn priority(&self) -> i64 {
        self.extras
            .get("priority")
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// Sets the priority.
    pub fn set_priority(&mut self, priority: i64) {
        self.extras.insert("priority".into(), Value::from(priority));
    }

    /// Returns `true` if the handler carries a command or command-group filter.
    pub fn is_command(&self) -> bool {
        self.filters.iter().any(Filter::is_command)
    }

    /// Names and aliases of the first command-like filter.
    pub fn command_spec(&self) -> Option<CommandSpec> {
        self.filters.iter().find_map(Filter::command_spec)
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("event_type", &self.event_type)
            .field("full_name", &self.full_name)
            .field("priority", &self.priority())
            .field("filters", &self.filters)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop(_: HandlerCall) -> HandlerResult {
        Ok(())
    }

    #[test]
    fn test_full_name_and_priority() {
        let h = HandlerDescriptor::new(EventType::AdapterMessage, "weather", "today", into_handler(noop));
        assert_eq!(h.full_name, "weather_today");
        assert_eq!(h.priority(), 0);

        let h = h.with_priority(5);
        assert_eq!(h.priority(), 5);
    }

    #[test]
    fn test_non_integer_priority_defaults() {
        let mut h = HandlerDescriptor::new(EventType::AdapterMessage, "m", "h", into_handler(noop));
        h.extras.insert("priority".into(), Value::from("high"));
        assert_eq!(h.priority(), 0);
    }
}
