//! Plan Service
//!
//! Entry point for running plans. `submit` spawns the scheduler on its own
//! task and hands back a `PlanHandle` with a per-plan event stream; `cancel`
//! fires the plan's shared cancellation token.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use cascade_core::{AgentEvent, CancellationToken, ChannelEventSink, EventSink, FanoutEventSink, NullEventSink};
use cascade_llm::LlmProvider;
use cascade_tools::{ToolCatalog, ToolProvider};

use crate::models::{PlanExecutionResult, SubTaskStatus, TaskPlan};
use crate::services::orchestrator::{AgenticToolLoop, SingleShotRunner};
use crate::storage::{CascadeConfig, InvocationRecorder};
use crate::utils::error::{AppError, AppResult};

use super::scheduler::{ScheduleReport, TaskScheduler};
use super::synthesis::{compile_with_fallback, concatenate, ConcatenationCompiler, LlmSynthesisCompiler, ResultCompiler};
use super::worker_runner::DefaultWorkerRunner;

type RunningPlans = Arc<RwLock<HashMap<String, CancellationToken>>>;

/// A submitted plan.
pub struct PlanHandle {
    pub task_id: String,
    pub plan_id: String,
    events: Option<UnboundedReceiverStream<AgentEvent>>,
    join: JoinHandle<AppResult<PlanExecutionResult>>,
}

impl PlanHandle {
    /// Take the plan's event stream. Only the first call returns it.
    pub fn take_events(&mut self) -> Option<UnboundedReceiverStream<AgentEvent>> {
        self.events.take()
    }

    /// Wait for the plan to finish.
    pub async fn wait(self) -> AppResult<PlanExecutionResult> {
        self.join
            .await
            .map_err(|e| AppError::internal(format!("plan task failed: {}", e)))?
    }
}

/// Runs plans and tracks the ones in flight by task id.
pub struct PlanService {
    scheduler: Arc<TaskScheduler>,
    compiler: Arc<dyn ResultCompiler>,
    events: Arc<dyn EventSink>,
    running: RunningPlans,
}

impl PlanService {
    pub fn new(scheduler: Arc<TaskScheduler>, compiler: Arc<dyn ResultCompiler>) -> Self {
        Self {
            scheduler,
            compiler,
            events: Arc::new(NullEventSink),
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Sink that receives the events of every plan, next to each handle's
    /// own stream.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Wire the full stack from one configuration.
    pub async fn from_config(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolProvider>,
        config: &CascadeConfig,
        working_dir: impl Into<PathBuf>,
        recorder: Arc<dyn InvocationRecorder>,
    ) -> AppResult<Self> {
        config.validate().map_err(AppError::validation)?;

        let catalog = Arc::new(ToolCatalog::from_provider(tools.as_ref()).await);
        tracing::info!(
            provider = provider.name(),
            model = provider.model(),
            tools = catalog.specs().len(),
            "building plan service"
        );

        let tool_loop = AgenticToolLoop::builder(provider.clone(), tools, catalog)
            .config(config.agent.clone())
            .compaction(config.compaction.clone())
            .gateway(config.gateway.clone())
            .retry(config.retry.clone())
            .recorder(recorder.clone())
            .build();
        let single_shot = SingleShotRunner::new(provider.clone())
            .with_retry(config.retry.clone())
            .with_config(config.single_shot.clone());
        let runner = DefaultWorkerRunner::new(Arc::new(tool_loop), Arc::new(single_shot)).with_recorder(recorder);

        let compiler: Arc<dyn ResultCompiler> = if config.scheduler.llm_synthesis {
            Arc::new(LlmSynthesisCompiler::new(provider).with_retry(config.retry.clone()))
        } else {
            Arc::new(ConcatenationCompiler)
        };
        let scheduler = TaskScheduler::new(Arc::new(runner), config.scheduler.clone(), working_dir);
        Ok(Self::new(Arc::new(scheduler), compiler))
    }

    /// Start executing `plan` in the background.
    pub async fn submit(&self, plan: TaskPlan) -> AppResult<PlanHandle> {
        plan.validate()?;

        let cancel = CancellationToken::new();
        {
            let mut running = self.running.write().await;
            if running.contains_key(&plan.task_id) {
                return Err(AppError::validation(format!(
                    "task '{}' is already running",
                    plan.task_id
                )));
            }
            running.insert(plan.task_id.clone(), cancel.clone());
        }

        let (channel, rx) = ChannelEventSink::channel();
        let events: Arc<dyn EventSink> = Arc::new(FanoutEventSink::new(vec![
            Arc::new(channel),
            self.events.clone(),
        ]));

        let task_id = plan.task_id.clone();
        let plan_id = plan.id.clone();
        tracing::info!(task_id = %task_id, plan_id = %plan_id, subtasks = plan.subtasks.len(), "plan submitted");

        let scheduler = self.scheduler.clone();
        let compiler = self.compiler.clone();
        let running = self.running.clone();
        let key = task_id.clone();
        let join = tokio::spawn(async move {
            let result = Self::run_plan(plan, scheduler, compiler, cancel, events).await;
            running.write().await.remove(&key);
            result
        });

        Ok(PlanHandle {
            task_id,
            plan_id,
            events: Some(UnboundedReceiverStream::new(rx)),
            join,
        })
    }

    /// Cancel a running plan. Returns false if no plan runs under `task_id`
    /// or it was already cancelled.
    pub async fn cancel(&self, task_id: &str, reason: impl Into<String>) -> bool {
        let running = self.running.read().await;
        match running.get(task_id) {
            Some(token) => {
                let reason = reason.into();
                tracing::info!(task_id = %task_id, reason = %reason, "cancelling plan");
                token.cancel(reason)
            }
            None => false,
        }
    }

    /// Task ids of plans still in flight.
    pub async fn running(&self) -> Vec<String> {
        self.running.read().await.keys().cloned().collect()
    }

    async fn run_plan(
        mut plan: TaskPlan,
        scheduler: Arc<TaskScheduler>,
        compiler: Arc<dyn ResultCompiler>,
        cancel: CancellationToken,
        events: Arc<dyn EventSink>,
    ) -> AppResult<PlanExecutionResult> {
        let started = Instant::now();

        let report = match scheduler.execute(&mut plan, &cancel, events.clone()).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(plan_id = %plan.id, error = %e, "plan aborted");
                events.emit(AgentEvent::Error {
                    worker_id: None,
                    message: e.to_string(),
                    code: Some("plan_aborted".to_string()),
                });
                emit_completed(&events, &plan, false, cancel.is_cancelled());
                return Err(e);
            }
        };
        let ScheduleReport { rounds, cancelled } = report;

        let output = if cancelled {
            concatenate(&plan)
        } else {
            compile_with_fallback(compiler.as_ref(), &plan, &cancel).await
        };

        let result = PlanExecutionResult::from_plan(
            &plan,
            output,
            rounds,
            started.elapsed().as_millis() as u64,
            cancelled,
        );
        tracing::info!(
            plan_id = %result.plan_id,
            success = result.success,
            completed = result.completed,
            failed = result.failed,
            rounds = result.rounds,
            duration_ms = result.duration_ms,
            "plan finished"
        );
        emit_completed(&events, &plan, result.success, cancelled);
        Ok(result)
    }
}

fn emit_completed(events: &Arc<dyn EventSink>, plan: &TaskPlan, success: bool, cancelled: bool) {
    events.emit(AgentEvent::PlanCompleted {
        plan_id: plan.id.clone(),
        success,
        completed: plan.count(SubTaskStatus::Completed),
        failed: plan.count(SubTaskStatus::Failed),
        cancelled,
    });
}
