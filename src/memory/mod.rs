//! Conversation memory
//!
//! Canonical conversation state and the bounded context window built from it
//! before every model call.

pub mod store;
pub mod context_manager;

pub use store::{ConversationState, ToolExchange};
pub use context_manager::{ContextConfig, ContextManager, MessageTag, MAX_FAILED_VALIDATIONS};
