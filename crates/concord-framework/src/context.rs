//! Per-event state shared by every stage and handler.
//!
//! One [`EventContext`] is created per inbound message and wrapped in an
//! `Arc` that every stage and handler receives. Calling
//! [`stop_event`](EventContext::stop_event) from any handler is immediately
//! visible to the pipeline and to all later handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use concord_core::{MessageChain, MessageEvent, MessageOrigin};

use crate::error::OutboundError;
use crate::filter::ParamValue;
use crate::handler::HandlerDescriptor;
use crate::llm::ProviderRequest;
use crate::outbound::Outbound;

/// Sender role resolved by the wake stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Regular member.
    #[default]
    Member,
    /// Configured administrator.
    Admin,
}

/// The reply a handler produced for this event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventResult {
    /// Reply content.
    pub chain: MessageChain,
}

impl EventResult {
    /// Creates a plain-text result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            chain: MessageChain::new().text(text),
        }
    }
}

impl From<MessageChain> for EventResult {
    fn from(chain: MessageChain) -> Self {
        Self { chain }
    }
}

#[derive(Debug, Default)]
struct EventState {
    is_wake: bool,
    is_at_or_wake_command: bool,
    role: Role,
    message_str: String,
    plugins_name: Option<Vec<String>>,
    activated: Vec<Arc<HandlerDescriptor>>,
    handler_params: HashMap<String, Vec<ParamValue>>,
    result: Option<EventResult>,
}

/// The shared context for one event.
pub struct EventContext {
    event: MessageEvent,
    outbound: Arc<dyn Outbound>,
    stopped: AtomicBool,
    state: Mutex<EventState>,
}

impl EventContext {
    /// Creates a context for `event` whose side effects go through `outbound`.
    pub fn new(event: MessageEvent, outbound: Arc<dyn Outbound>) -> Self {
        let state = EventState {
            message_str: event.message_str.clone(),
            ..Default::default()
        };
        Self {
            event,
            outbound,
            stopped: AtomicBool::new(false),
            state: Mutex::new(state),
        }
    }

    /// Returns the inbound event.
    pub fn event(&self) -> &MessageEvent {
        &self.event
    }

    /// Returns the unified origin of the event.
    pub fn origin(&self) -> MessageOrigin {
        self.event.origin()
    }

    /// Returns the sender's user id.
    pub fn sender_id(&self) -> &str {
        &self.event.sender.user_id
    }

    // ─── Wake state ──────────────────────────────────────────────────────────

    /// Message text with any wake prefix stripped.
    pub fn message_str(&self) -> String {
        self.state.lock().message_str.clone()
    }

    pub(crate) fn set_message_str(&self, text: impl Into<String>) {
        self.state.lock().message_str = text.into();
    }

    /// Returns `true` once the event has been woken.
    pub fn is_wake(&self) -> bool {
        self.state.lock().is_wake
    }

    /// Marks the event as woken. `command_eligible` also admits it to command
    /// dispatch; `false` never revokes eligibility granted earlier.
    pub fn mark_woken(&self, command_eligible: bool) {
        let mut state = self.state.lock();
        state.is_wake = true;
        state.is_at_or_wake_command |= command_eligible;
    }

    /// Returns `true` if the event was woken by a prefix, mention or private chat.
    pub fn is_at_or_wake_command(&self) -> bool {
        self.state.lock().is_at_or_wake_command
    }

    /// Returns the sender's role.
    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    /// Sets the sender's role.
    pub fn set_role(&self, role: Role) {
        self.state.lock().role = role;
    }

    /// Returns `true` if the sender has the admin role.
    pub fn is_admin(&self) -> bool {
        self.role() == Role::Admin
    }

    /// Plugin allowlist attached by the wake stage; `None` allows all.
    pub fn plugins_name(&self) -> Option<Vec<String>> {
        self.state.lock().plugins_name.clone()
    }

    pub(crate) fn set_plugins_name(&self, plugins: Option<Vec<String>>) {
        self.state.lock().plugins_name = plugins;
    }

    // ─── Activated handlers ──────────────────────────────────────────────────

    /// Handlers activated for this event, in execution order.
    pub fn activated_handlers(&self) -> Vec<Arc<HandlerDescriptor>> {
        self.state.lock().activated.clone()
    }

    /// Attaches the activated handler set and their parsed parameters.
    pub fn set_activated(
        &self,
        handlers: Vec<Arc<HandlerDescriptor>>,
        params: HashMap<String, Vec<ParamValue>>,
    ) {
        let mut state = self.state.lock();
        state.activated = handlers;
        state.handler_params = params;
    }

    /// Parsed command parameters for `full_name`.
    pub fn params_for(&self, full_name: &str) -> Vec<ParamValue> {
        self.state
            .lock()
            .handler_params
            .get(full_name)
            .cloned()
            .unwrap_or_default()
    }

    // ─── Propagation ─────────────────────────────────────────────────────────

    /// Stops the event: no further handler or stage runs (the respond stage
    /// still delivers a result that was already set).
    pub fn stop_event(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Clears a previous [`stop_event`](Self::stop_event).
    pub fn continue_event(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Returns `true` if the event has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ─── Result ──────────────────────────────────────────────────────────────

    /// Replaces the event result.
    pub fn set_result(&self, result: impl Into<EventResult>) {
        self.state.lock().result = Some(result.into());
    }

    /// Returns a copy of the current result.
    pub fn result(&self) -> Option<EventResult> {
        self.state.lock().result.clone()
    }

    /// Removes the event result.
    pub fn clear_result(&self) {
        self.state.lock().result = None;
    }

    /// Locks the result chain for in-place editing, creating an empty result
    /// when none is set.
    pub fn result_chain(&self) -> MappedMutexGuard<'_, MessageChain> {
        MutexGuard::map(self.state.lock(), |state| {
            &mut state.result.get_or_insert_with(EventResult::default).chain
        })
    }

    // ─── Outbound ────────────────────────────────────────────────────────────

    /// Sends a message to the event's origin.
    pub async fn send(&self, chain: MessageChain) -> Result<(), OutboundError> {
        self.outbound.send(&self.origin(), chain).await
    }

    /// Sends a message to the event's origin in chunks.
    pub async fn send_streaming(&self, chunks: Vec<MessageChain>) -> Result<(), OutboundError> {
        self.outbound.send_streaming(&self.origin(), chunks).await
    }

    /// Reacts to the inbound message.
    pub async fn react(&self, emoji: &str) -> Result<(), OutboundError> {
        self.outbound
            .react(&self.origin(), &self.event.message_id, emoji)
            .await
    }

    /// Issues a nested LLM request.
    pub async fn request_llm(&self, request: ProviderRequest) -> Result<String, OutboundError> {
        self.outbound.request_llm(request).await
    }
}

impl std::fmt::Debug for EventContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventContext")
            .field("event", &self.event)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::NoopOutbound;
    use concord_core::{MessageType, PlatformMeta, Sender};

    fn ctx() -> EventContext {
        let event = MessageEvent::new(
            PlatformMeta {
                name: "onebot".into(),
                id: "qq".into(),
            },
            MessageType::FriendMessage,
            "42",
            "10000",
            Sender {
                user_id: "42".into(),
                nickname: None,
            },
            MessageChain::new().text("hi"),
        );
        EventContext::new(event, Arc::new(NoopOutbound))
    }

    #[test]
    fn test_stop_and_continue() {
        let ctx = ctx();
        assert!(!ctx.is_stopped());
        ctx.stop_event();
        assert!(ctx.is_stopped());
        ctx.continue_event();
        assert!(!ctx.is_stopped());
    }

    #[test]
    fn test_result_chain_creates_result() {
        let ctx = ctx();
        assert!(ctx.result().is_none());
        ctx.result_chain().push(concord_core::MessageSegment::text("a"));
        ctx.result_chain().push(concord_core::MessageSegment::text("b"));
        assert_eq!(ctx.result().unwrap().chain.plain_text(), "ab");
        ctx.clear_result();
        assert!(ctx.result().is_none());
    }

    #[test]
    fn test_wake_flags() {
        let ctx = ctx();
        assert!(!ctx.is_wake());
        ctx.mark_woken(false);
        assert!(ctx.is_wake());
        assert!(!ctx.is_at_or_wake_command());
        ctx.mark_woken(true);
        assert!(ctx.is_at_or_wake_command());
        ctx.mark_woken(false);
        assert!(ctx.is_at_or_wake_command());
        assert_eq!(ctx.message_str(), "hi");
    }
}
