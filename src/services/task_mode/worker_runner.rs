//! Worker dispatch
//!
//! Tool-using kinds go through the agentic tool loop; the rest get a single
//! model call with one self-correction retry. Both paths hand the finished
//! invocation to the recorder.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use cascade_core::{AgentEvent, EventSink, ExecutionContext, WorkerContext, WorkerResult};

use crate::services::orchestrator::{build_task_message, AgenticToolLoop, SingleShotRunner};
use crate::storage::{InvocationRecord, InvocationRecorder, NoopRecorder};

/// Runs one sub-task attempt to a `WorkerResult`. Never fails: every error is
/// folded into the result's status and termination reason.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    async fn run(&self, task: &str, ctx: &WorkerContext, events: Arc<dyn EventSink>) -> WorkerResult;
}

pub struct DefaultWorkerRunner {
    tool_loop: Arc<AgenticToolLoop>,
    single_shot: Arc<SingleShotRunner>,
    recorder: Arc<dyn InvocationRecorder>,
}

impl DefaultWorkerRunner {
    pub fn new(tool_loop: Arc<AgenticToolLoop>, single_shot: Arc<SingleShotRunner>) -> Self {
        Self {
            tool_loop,
            single_shot,
            recorder: Arc::new(NoopRecorder),
        }
    }

    /// Sink for single-shot invocations. The tool loop carries its own.
    pub fn with_recorder(mut self, recorder: Arc<dyn InvocationRecorder>) -> Self {
        self.recorder = recorder;
        self
    }
}

#[async_trait]
impl WorkerRunner for DefaultWorkerRunner {
    async fn run(&self, task: &str, ctx: &WorkerContext, events: Arc<dyn EventSink>) -> WorkerResult {
        let kind = ctx.worker_kind();
        tracing::debug!(worker_id = %ctx.worker_id(), kind = %kind, tools = kind.uses_tools(), "dispatching worker");

        if kind.uses_tools() {
            return self.tool_loop.run_with_events(task, ctx, events).await;
        }

        let started_at = Utc::now();
        let (result, attempts) = self.single_shot.run_counted(&build_task_message(task, ctx), ctx).await;
        events.emit(AgentEvent::WorkerFinished {
            worker_id: ctx.worker_id().to_string(),
            status: result.status,
            termination: result.termination,
            confidence: result.confidence,
        });

        let record = InvocationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: ctx.task_id().to_string(),
            worker_id: ctx.worker_id().to_string(),
            worker_kind: kind,
            model: result.model.clone(),
            status: result.status,
            termination: result.termination,
            confidence: result.confidence,
            steps: attempts,
            tool_calls: 0,
            tokens: result.tokens,
            compactions: 0,
            started_at,
            finished_at: Utc::now(),
        };
        if let Err(e) = self.recorder.record(&record).await {
            tracing::warn!(worker_id = %ctx.worker_id(), error = %e, "failed to record invocation");
        }
        result
    }
}
