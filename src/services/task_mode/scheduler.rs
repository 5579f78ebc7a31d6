//! Round-Based DAG Scheduler
//!
//! Drives a `TaskPlan` to a terminal state. Every round computes the ready
//! set (pending or requeued sub-tasks whose dependencies have all resolved),
//! runs it concurrently, and folds the results back into the plan.
//!
//! Failure is not fatal: a sub-task that exhausts its attempts is marked
//! failed but still counts as resolved, so its dependents run on whatever
//! was produced. Only an empty ready set with work remaining aborts the plan.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::{join_all, FutureExt};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use cascade_core::{AgentEvent, CancellationToken, EventSink, WorkerContext, WorkerResult};

use crate::models::{SubTask, SubTaskStatus, TaskPlan};
use crate::utils::error::{AppError, AppResult};

use super::worker_runner::WorkerRunner;

// ============================================================================
// Configuration
// ============================================================================

fn default_llm_synthesis() -> bool {
    true
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on workers running at once within a round. `None` runs
    /// the whole ready set together.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Compile the final answer with a model call (concatenation otherwise)
    #[serde(default = "default_llm_synthesis")]
    pub llm_synthesis: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            llm_synthesis: default_llm_synthesis(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == Some(0) {
            return Err("scheduler.max_concurrency must be at least 1 when set".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Round planning
// ============================================================================

/// Sub-tasks that can run together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRound {
    /// Round index (0-based)
    pub index: usize,
    pub subtask_ids: Vec<String>,
}

/// Layer a plan with Kahn's algorithm, assuming every attempt succeeds.
///
/// Layer 0 holds sub-tasks without dependencies, layer 1 those depending only
/// on layer 0, and so on. Dependencies on ids outside the plan count as
/// resolved. Ids keep plan order within a layer. A cycle is reported as
/// `DependencyExhausted`.
pub fn plan_rounds(plan: &TaskPlan) -> AppResult<Vec<ExecutionRound>> {
    let ids: HashSet<&str> = plan.subtasks.iter().map(|s| s.id.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for subtask in &plan.subtasks {
        in_degree.entry(subtask.id.as_str()).or_insert(0);
        for dep in &subtask.dependencies {
            if !ids.contains(dep.as_str()) {
                continue;
            }
            *in_degree.entry(subtask.id.as_str()).or_insert(0) += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(subtask.id.as_str());
        }
    }

    let mut remaining: Vec<&str> = plan.subtasks.iter().map(|s| s.id.as_str()).collect();
    let mut rounds = Vec::new();
    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|id| in_degree.get(*id).copied().unwrap_or(0) == 0)
            .copied()
            .collect();
        if ready.is_empty() {
            break;
        }

        rounds.push(ExecutionRound {
            index: rounds.len(),
            subtask_ids: ready.iter().map(|id| id.to_string()).collect(),
        });

        remaining.retain(|id| !ready.contains(id));
        for id in &ready {
            if let Some(children) = dependents.get(id) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
        }
    }

    if !remaining.is_empty() {
        return Err(AppError::dependency_exhausted(format!(
            "circular dependency among sub-tasks: {}",
            remaining.join(", ")
        )));
    }
    Ok(rounds)
}

/// Ids of sub-tasks eligible to run now, in plan order.
pub fn ready_set(plan: &TaskPlan) -> Vec<String> {
    let status: HashMap<&str, SubTaskStatus> = plan
        .subtasks
        .iter()
        .map(|s| (s.id.as_str(), s.status))
        .collect();
    plan.subtasks
        .iter()
        .filter(|s| s.status.is_ready_candidate())
        .filter(|s| {
            s.dependencies.iter().all(|dep| {
                status
                    .get(dep.as_str())
                    .map_or(true, |st| st.is_resolved())
            })
        })
        .map(|s| s.id.clone())
        .collect()
}

/// Dependencies naming ids absent from the plan, as `(subtask, dependency)`.
pub fn unknown_dependencies(plan: &TaskPlan) -> Vec<(String, String)> {
    plan.subtasks
        .iter()
        .flat_map(|s| {
            s.dependencies
                .iter()
                .filter(|dep| !plan.contains(dep))
                .map(move |dep| (s.id.clone(), dep.clone()))
        })
        .collect()
}

// ============================================================================
// TaskScheduler
// ============================================================================

/// How scheduling ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleReport {
    pub rounds: usize,
    pub cancelled: bool,
}

/// Drives one plan round by round.
pub struct TaskScheduler {
    runner: Arc<dyn WorkerRunner>,
    config: SchedulerConfig,
    working_dir: PathBuf,
}

impl TaskScheduler {
    pub fn new(runner: Arc<dyn WorkerRunner>, config: SchedulerConfig, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            config,
            working_dir: working_dir.into(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run `plan` until every sub-task is resolved, cancellation fires, or
    /// the dependency graph stalls.
    pub async fn execute(
        &self,
        plan: &mut TaskPlan,
        cancel: &CancellationToken,
        events: Arc<dyn EventSink>,
    ) -> AppResult<ScheduleReport> {
        plan.validate()?;
        for (subtask, dep) in unknown_dependencies(plan) {
            tracing::warn!(
                plan_id = %plan.id,
                subtask = %subtask,
                dependency = %dep,
                "dependency not in plan; treating it as resolved"
            );
        }

        let estimated_rounds = plan_rounds(plan).ok().map(|r| r.len());
        events.emit(AgentEvent::PlanStarted {
            plan_id: plan.id.clone(),
            subtasks: plan.subtasks.len(),
            estimated_rounds,
        });

        let mut round = 0usize;
        loop {
            if cancel.is_cancelled() {
                tracing::info!(plan_id = %plan.id, round, "plan cancelled");
                return Ok(ScheduleReport {
                    rounds: round,
                    cancelled: true,
                });
            }
            if plan.is_finished() {
                return Ok(ScheduleReport {
                    rounds: round,
                    cancelled: false,
                });
            }

            let ready = ready_set(plan);
            if ready.is_empty() {
                let waiting: Vec<&str> = plan
                    .subtasks
                    .iter()
                    .filter(|s| !s.status.is_resolved())
                    .map(|s| s.id.as_str())
                    .collect();
                tracing::error!(plan_id = %plan.id, waiting = ?waiting, "no sub-task is ready");
                return Err(AppError::dependency_exhausted(format!(
                    "no ready sub-task while {} remain: {}",
                    waiting.len(),
                    waiting.join(", ")
                )));
            }

            round += 1;
            tracing::info!(plan_id = %plan.id, round, ready = ?ready, "starting round");
            events.emit(AgentEvent::RoundStarted {
                plan_id: plan.id.clone(),
                round,
                subtask_ids: ready.clone(),
            });

            let results = self.run_round(plan, &ready, cancel, &events).await?;
            for (id, result) in results {
                self.apply_result(plan, &id, result, &events);
            }
        }
    }

    /// Start every ready sub-task and run them concurrently. Results come
    /// back in `ready` order.
    async fn run_round(
        &self,
        plan: &mut TaskPlan,
        ready: &[String],
        cancel: &CancellationToken,
        events: &Arc<dyn EventSink>,
    ) -> AppResult<Vec<(String, WorkerResult)>> {
        let siblings: Arc<HashMap<String, WorkerResult>> = Arc::new(
            plan.subtasks
                .iter()
                .filter(|s| s.status.is_resolved())
                .filter_map(|s| s.result.clone().map(|r| (s.id.clone(), r)))
                .collect(),
        );

        let plan_id = plan.id.clone();
        let task_id = plan.task_id.clone();
        let parent_task = plan.task.clone();

        let mut jobs: Vec<(String, String, WorkerContext)> = Vec::with_capacity(ready.len());
        for id in ready {
            let subtask = plan
                .get_mut(id)
                .ok_or_else(|| AppError::not_found(format!("sub-task '{}'", id)))?;
            subtask.start()?;
            emit_status(events, &plan_id, subtask);

            let ctx = WorkerContext::new(task_id.clone(), subtask.worker_kind, self.working_dir.clone(), cancel.clone())
                .with_plan(plan_id.clone(), subtask.id.clone())
                .with_worker_id(worker_id(&subtask.id))
                .with_parent_task(parent_task.clone())
                .with_sibling_results(siblings.clone());
            jobs.push((subtask.id.clone(), subtask.description.clone(), ctx));
        }

        let runner = &self.runner;
        let futures = jobs.into_iter().map(|(id, description, ctx)| {
            let events = events.clone();
            async move {
                let result = runner.run(&description, &ctx, events).await;
                (id, result)
            }
            .boxed()
        });

        let results = match self.config.max_concurrency {
            Some(limit) if limit < ready.len() => {
                let mut tagged: Vec<(usize, (String, WorkerResult))> = stream::iter(
                    futures
                        .enumerate()
                        .map(|(i, fut)| async move { (i, fut.await) }.boxed())
                        .collect::<Vec<_>>(),
                )
                .buffer_unordered(limit)
                    .collect()
                    .await;
                tagged.sort_by_key(|(i, _)| *i);
                tagged.into_iter().map(|(_, r)| r).collect()
            }
            _ => join_all(futures).await,
        };
        Ok(results)
    }

    fn apply_result(&self, plan: &mut TaskPlan, id: &str, result: WorkerResult, events: &Arc<dyn EventSink>) {
        let plan_id = plan.id.clone();
        let Some(subtask) = plan.get_mut(id) else {
            return;
        };
        if result.status.is_usable() {
            tracing::info!(plan_id = %plan_id, subtask = %id, status = %result.status, "sub-task completed");
            subtask.complete(result);
        } else {
            let requeued = subtask.record_failure(result);
            tracing::warn!(
                plan_id = %plan_id,
                subtask = %id,
                attempt = subtask.attempts,
                max_attempts = subtask.max_attempts,
                requeued,
                error = subtask.error.as_deref().unwrap_or(""),
                "sub-task failed"
            );
        }
        emit_status(events, &plan_id, subtask);
    }
}

fn worker_id(subtask_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", subtask_id, &suffix[..8])
}

fn emit_status(events: &Arc<dyn EventSink>, plan_id: &str, subtask: &SubTask) {
    events.emit(AgentEvent::SubTaskUpdated {
        plan_id: plan_id.to_string(),
        subtask_id: subtask.id.clone(),
        status: subtask.status.as_str().to_string(),
        attempts: subtask.attempts,
        error: subtask.error.clone(),
    });
}
