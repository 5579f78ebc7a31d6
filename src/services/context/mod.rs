//! Context Management
//!
//! Conversation history with token accounting for one loop invocation, and
//! the structural digest folded into condensation markers.

mod conversation;
mod digest;

pub use conversation::{
    message_tokens, Condensation, ConversationState, Eviction, MESSAGE_OVERHEAD_TOKENS,
};
pub use digest::{extract_definitions, structural_digest};
