//! Plan Execution Result
//!
//! Final outcome of running a plan: the compiled answer plus per-sub-task
//! terminal state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use cascade_core::{TokenCounts, WorkerResult};

use super::plan::{SubTask, SubTaskStatus, TaskPlan};

/// Overall execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExecutionResult {
    pub plan_id: String,
    pub task_id: String,
    /// Every sub-task completed and nothing was cancelled
    pub success: bool,
    /// Synthesized answer compiled from all terminal outputs
    pub output: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Scheduling rounds executed
    pub rounds: usize,
    pub duration_ms: u64,
    pub cancelled: bool,
    /// Tokens spent across all workers
    pub tokens: TokenCounts,
    /// Terminal state of every sub-task, in plan order
    pub subtasks: Vec<SubTask>,
}

impl PlanExecutionResult {
    /// Summarize a plan whose scheduling has ended.
    pub fn from_plan(plan: &TaskPlan, output: String, rounds: usize, duration_ms: u64, cancelled: bool) -> Self {
        let completed = plan.count(SubTaskStatus::Completed);
        let failed = plan.count(SubTaskStatus::Failed);
        let mut tokens = TokenCounts::default();
        for result in plan.subtasks.iter().filter_map(|s| s.result.as_ref()) {
            tokens.add(result.tokens.input, result.tokens.output);
        }
        Self {
            plan_id: plan.id.clone(),
            task_id: plan.task_id.clone(),
            success: !cancelled && failed == 0 && completed == plan.subtasks.len(),
            output,
            total: plan.subtasks.len(),
            completed,
            failed,
            rounds,
            duration_ms,
            cancelled,
            tokens,
            subtasks: plan.subtasks.clone(),
        }
    }

    /// Latest worker result per sub-task id.
    pub fn results(&self) -> HashMap<&str, &WorkerResult> {
        self.subtasks
            .iter()
            .filter_map(|s| s.result.as_ref().map(|r| (s.id.as_str(), r)))
            .collect()
    }

    pub fn subtask(&self, id: &str) -> Option<&SubTask> {
        self.subtasks.iter().find(|s| s.id == id)
    }
}
