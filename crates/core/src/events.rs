//! Observability Events
//!
//! Structured events emitted by the tool loop and the scheduler. Emitters hold
//! an `Arc<dyn EventSink>` passed in at construction; nothing here is global.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::worker::{TerminationReason, WorkerStatus};

/// Structured event describing loop or scheduler progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    // ========================================================================
    // Worker loop events
    // ========================================================================
    /// A step is about to call the model
    ThinkingStarted { worker_id: String, step: u32 },

    /// Reasoning text surfaced for display only
    Reasoning { worker_id: String, content: String },

    /// A tool call went through the gateway
    ToolCalled {
        worker_id: String,
        tool: String,
        success: bool,
        duration_ms: u64,
        summary: String,
        #[serde(default)]
        deduplicated: bool,
    },

    /// A step finished
    StepCompleted {
        worker_id: String,
        step: u32,
        tool_calls: usize,
        input_tokens: u32,
        output_tokens: u32,
    },

    /// Context usage after a step
    ContextUsage {
        worker_id: String,
        used_tokens: u32,
        budget_tokens: u32,
        ratio: f32,
    },

    /// History was condensed or file content evicted
    ContextCompacted {
        worker_id: String,
        turns_folded: usize,
        tokens_before: u32,
        tokens_after: u32,
        evicted_files: usize,
    },

    /// Non-fatal warning (repetition warnings, protocol fallbacks)
    Warning { worker_id: String, message: String },

    /// An error worth surfacing
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// A worker invocation ended
    WorkerFinished {
        worker_id: String,
        status: WorkerStatus,
        termination: TerminationReason,
        confidence: f32,
    },

    // ========================================================================
    // Scheduler events
    // ========================================================================
    /// A plan was accepted for execution
    PlanStarted {
        plan_id: String,
        subtasks: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_rounds: Option<usize>,
    },

    /// A scheduling round is launching its ready set
    RoundStarted {
        plan_id: String,
        round: usize,
        subtask_ids: Vec<String>,
    },

    /// A sub-task changed status
    SubTaskUpdated {
        plan_id: String,
        subtask_id: String,
        status: String,
        attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The plan reached a terminal state
    PlanCompleted {
        plan_id: String,
        success: bool,
        completed: usize,
        failed: usize,
        cancelled: bool,
    },
}

impl AgentEvent {
    /// Stable snake_case name of the variant, matching the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::ThinkingStarted { .. } => "thinking_started",
            AgentEvent::Reasoning { .. } => "reasoning",
            AgentEvent::ToolCalled { .. } => "tool_called",
            AgentEvent::StepCompleted { .. } => "step_completed",
            AgentEvent::ContextUsage { .. } => "context_usage",
            AgentEvent::ContextCompacted { .. } => "context_compacted",
            AgentEvent::Warning { .. } => "warning",
            AgentEvent::Error { .. } => "error",
            AgentEvent::WorkerFinished { .. } => "worker_finished",
            AgentEvent::PlanStarted { .. } => "plan_started",
            AgentEvent::RoundStarted { .. } => "round_started",
            AgentEvent::SubTaskUpdated { .. } => "sub_task_updated",
            AgentEvent::PlanCompleted { .. } => "plan_completed",
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Receiver of observability events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AgentEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: AgentEvent) {}
}

/// Forwards events into `tracing` at a level chosen per variant.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: AgentEvent) {
        match &event {
            AgentEvent::Error { message, .. } => {
                tracing::error!(kind = event.kind(), %message, "agent event")
            }
            AgentEvent::Warning { worker_id, message } => {
                tracing::warn!(kind = event.kind(), %worker_id, %message, "agent event")
            }
            AgentEvent::Reasoning { .. } | AgentEvent::ContextUsage { .. } => {
                tracing::trace!(kind = event.kind(), ?event, "agent event")
            }
            _ => tracing::debug!(kind = event.kind(), ?event, "agent event"),
        }
    }
}

/// Pushes events onto an unbounded channel. A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}

/// Delivers each event to every inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: AgentEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
