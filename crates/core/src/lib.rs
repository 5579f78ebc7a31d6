//! Cascade Core
//!
//! Foundational types shared by every crate in the Cascade Agents workspace.
//! This crate depends on nothing else in the workspace and carries no LLM or
//! tool-provider code.
//!
//! ## Module Organization
//!
//! - `error` - Core error types (`CoreError`, `CoreResult`)
//! - `cancellation` - Cooperative cancellation with reason and callback fan-out
//! - `worker` - Worker kinds, capability sets, and immutable worker results
//! - `context` - Per-invocation worker context and the narrower tool context
//! - `streaming` - Provider-agnostic stream chunks emitted while a model responds
//! - `events` - Observability events and the injectable `EventSink` port

pub mod cancellation;
pub mod context;
pub mod error;
pub mod events;
pub mod streaming;
pub mod worker;

// ── Error Types ────────────────────────────────────────────────────────
pub use error::{CoreError, CoreResult};

// ── Cancellation ───────────────────────────────────────────────────────
pub use cancellation::CancellationToken;

// ── Worker Model ───────────────────────────────────────────────────────
pub use worker::{
    Capability, CapabilitySet, TerminationReason, TokenCounts, WorkerKind, WorkerResult,
    WorkerStatus,
};

// ── Context Hierarchy ──────────────────────────────────────────────────
pub use context::{Blackboard, ExecutionContext, ExecutionMode, ToolContext, WorkerContext};

// ── Streaming Types ────────────────────────────────────────────────────
pub use streaming::StreamChunk;

// ── Observability ──────────────────────────────────────────────────────
pub use events::{
    AgentEvent, ChannelEventSink, EventSink, FanoutEventSink, NullEventSink, TracingEventSink,
};
