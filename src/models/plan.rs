//! Plan Models
//!
//! A `TaskPlan` is produced once by an external planning step and handed to
//! the scheduler. Only the scheduler mutates its sub-tasks.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use cascade_core::{WorkerKind, WorkerResult};

use crate::utils::error::{AppError, AppResult};

fn default_max_attempts() -> u32 {
    3
}

/// Lifecycle of a sub-task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Failed with attempts left; eligible for the next round
    Retrying,
}

impl SubTaskStatus {
    /// Eligible for a round once dependencies resolve.
    pub fn is_ready_candidate(&self) -> bool {
        matches!(self, SubTaskStatus::Pending | SubTaskStatus::Retrying)
    }

    /// Resolved for dependency purposes. Terminal failure counts.
    pub fn is_resolved(&self) -> bool {
        matches!(self, SubTaskStatus::Completed | SubTaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubTaskStatus::Pending => "pending",
            SubTaskStatus::InProgress => "in_progress",
            SubTaskStatus::Completed => "completed",
            SubTaskStatus::Failed => "failed",
            SubTaskStatus::Retrying => "retrying",
        }
    }
}

impl fmt::Display for SubTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTask {
    pub id: String,
    pub description: String,
    pub worker_kind: WorkerKind,
    #[serde(default)]
    pub status: SubTaskStatus,
    /// Ids of sub-tasks that must resolve first
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkerResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubTask {
    pub fn new(id: impl Into<String>, description: impl Into<String>, worker_kind: WorkerKind) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            worker_kind,
            status: SubTaskStatus::Pending,
            dependencies: Vec::new(),
            attempts: 0,
            max_attempts: default_max_attempts(),
            result: None,
            error: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// pending/retrying → in-progress.
    pub fn start(&mut self) -> AppResult<()> {
        match self.status {
            SubTaskStatus::Pending => {}
            SubTaskStatus::Retrying if self.attempts < self.max_attempts => {}
            other => {
                return Err(AppError::validation(format!(
                    "sub-task '{}' cannot start from status {} (attempts {}/{})",
                    self.id, other, self.attempts, self.max_attempts
                )))
            }
        }
        self.status = SubTaskStatus::InProgress;
        Ok(())
    }

    /// in-progress → completed.
    pub fn complete(&mut self, result: WorkerResult) {
        self.status = SubTaskStatus::Completed;
        self.error = None;
        self.result = Some(result);
    }

    /// in-progress → retrying or failed. Returns true when requeued.
    ///
    /// A requeued sub-task carries the failure reason in its description so
    /// the next attempt can correct course. Cancelled results are never
    /// retried.
    pub fn record_failure(&mut self, result: WorkerResult) -> bool {
        let reason = result.failure_reason();
        self.attempts += 1;
        self.error = Some(reason.clone());
        let retry = !result.is_cancelled() && self.attempts < self.max_attempts;
        self.result = Some(result);
        if retry {
            self.status = SubTaskStatus::Retrying;
            self.description = format!(
                "{}\n\n[Previous attempt {} failed: {}]",
                self.description, self.attempts, reason
            );
        } else {
            self.status = SubTaskStatus::Failed;
        }
        retry
    }
}

/// Rough size of a plan as judged by the planner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanComplexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

/// A DAG of sub-tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPlan {
    pub id: String,
    /// Id of the top-level task this plan serves
    pub task_id: String,
    /// Original task text
    pub task: String,
    pub subtasks: Vec<SubTask>,
    #[serde(default)]
    pub estimated_complexity: PlanComplexity,
    #[serde(default)]
    pub required_kinds: Vec<WorkerKind>,
}

impl TaskPlan {
    pub fn new(task: impl Into<String>, subtasks: Vec<SubTask>) -> Self {
        let mut kinds: Vec<WorkerKind> = Vec::new();
        for subtask in &subtasks {
            if !kinds.contains(&subtask.worker_kind) {
                kinds.push(subtask.worker_kind);
            }
        }
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: uuid::Uuid::new_v4().to_string(),
            task: task.into(),
            subtasks,
            estimated_complexity: PlanComplexity::default(),
            required_kinds: kinds,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_complexity(mut self, complexity: PlanComplexity) -> Self {
        self.estimated_complexity = complexity;
        self
    }

    /// Parse and validate a plan from JSON.
    pub fn from_json(json: &str) -> AppResult<Self> {
        let plan: TaskPlan = serde_json::from_str(json)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Structural checks: unique non-empty ids, at least one attempt each,
    /// no self-dependency.
    pub fn validate(&self) -> AppResult<()> {
        let mut seen = HashSet::new();
        for subtask in &self.subtasks {
            if subtask.id.trim().is_empty() {
                return Err(AppError::validation("sub-task id must not be empty"));
            }
            if !seen.insert(subtask.id.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate sub-task id '{}'",
                    subtask.id
                )));
            }
            if subtask.max_attempts == 0 {
                return Err(AppError::validation(format!(
                    "sub-task '{}' must allow at least one attempt",
                    subtask.id
                )));
            }
            if subtask.dependencies.iter().any(|d| d == &subtask.id) {
                return Err(AppError::validation(format!(
                    "sub-task '{}' depends on itself",
                    subtask.id
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&SubTask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SubTask> {
        self.subtasks.iter_mut().find(|s| s.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subtasks.iter().any(|s| s.id == id)
    }

    /// Every sub-task is completed or failed.
    pub fn is_finished(&self) -> bool {
        self.subtasks.iter().all(|s| s.status.is_resolved())
    }

    pub fn count(&self, status: SubTaskStatus) -> usize {
        self.subtasks.iter().filter(|s| s.status == status).count()
    }
}
