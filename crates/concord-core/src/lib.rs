//! # Concord Core
//!
//! The data model shared by the live dispatch path and the diagnostic
//! analysis path of the Concord bot framework.
//!
//! This crate provides:
//! - **Events**: the inbound [`MessageEvent`] together with its unified
//!   origin ([`MessageOrigin`], the `platform:message_type:session_id` triple)
//! - **Messages**: platform-agnostic [`MessageSegment`]s and [`MessageChain`]
//! - **Handler event types**: the [`EventType`] tag every handler is bound to
//! - **Stages**: the fixed, ordered [`Stage`] sequence of the processing
//!   pipeline and the mapping from event types to the stages they run in
//!
//! ```text
//! inbound message ──▶ Waking ─▶ Whitelist ─▶ … ─▶ Process ─▶ ResultDecorate ─▶ Respond
//!                       ▲                            ▲              ▲             ▲
//!               AdapterMessage (trigger)   AdapterMessage,   OnDecorating   OnAfterMessageSent
//!                                          OnLlmRequest, …     Result
//! ```

pub mod error;
pub mod event;
pub mod message;
pub mod stage;

pub use error::{CoreError, CoreResult};
pub use event::{EventType, MessageEvent, MessageOrigin, MessageType, PlatformMeta, Sender};
pub use message::{MessageChain, MessageSegment};
pub use stage::Stage;
