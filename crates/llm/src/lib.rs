//! Cascade LLM
//!
//! Provider-agnostic interface for reaching a language model:
//! - message, request, and response types plus the transport error taxonomy
//! - the `LlmProvider` trait consumed by the tool loop and the scheduler
//! - stream accumulation and transport retry with exponential backoff
//!
//! Concrete provider clients live outside this workspace and implement
//! `LlmProvider`.

pub mod provider;
pub mod retry;
pub mod streaming;
pub mod types;

pub use provider::LlmProvider;
pub use retry::{complete_with_retry, stream_with_retry, RetryPolicy, StreamedResponse};
pub use streaming::StreamAccumulator;
pub use types::*;
