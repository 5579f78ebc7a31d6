//! Context Hierarchy
//!
//! Two concrete contexts share the `ExecutionContext` base:
//!
//! 1. `WorkerContext` - built fresh for every worker invocation by the
//!    scheduler; read-only and never persisted
//! 2. `ToolContext` - the narrower view handed to a tool provider for one call
//!
//! Tools only see `ToolContext` and cannot reach sibling results or the
//! scheduler's state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationToken;
use crate::error::CoreResult;
use crate::worker::{WorkerKind, WorkerResult};

// ============================================================================
// ExecutionContext Trait
// ============================================================================

/// Base execution context shared by worker and tool scopes.
pub trait ExecutionContext: Send + Sync {
    /// Identifier of the top-level task this execution belongs to.
    fn task_id(&self) -> &str;

    /// Directory tools resolve relative paths against.
    fn working_dir(&self) -> &Path;

    /// Kind of worker on whose behalf the execution runs.
    fn worker_kind(&self) -> WorkerKind;

    /// Shared cancellation token for the top-level task.
    fn cancellation(&self) -> &CancellationToken;
}

// ============================================================================
// Blackboard
// ============================================================================

/// Out-of-band shared note area some workers may use.
#[async_trait]
pub trait Blackboard: Send + Sync {
    async fn read(&self, key: &str) -> Option<String>;

    async fn write(&self, key: &str, value: String) -> CoreResult<()>;

    async fn keys(&self) -> Vec<String>;
}

/// Mode a worker runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Capability set applies unchanged
    #[default]
    Standard,
    /// Only read-only tools are permitted regardless of capabilities
    ReadOnly,
}

// ============================================================================
// WorkerContext
// ============================================================================

/// Per-invocation context for one worker.
#[derive(Clone)]
pub struct WorkerContext {
    task_id: String,
    plan_id: String,
    subtask_id: String,
    worker_id: String,
    worker_kind: WorkerKind,
    parent_task: String,
    sibling_results: Arc<HashMap<String, WorkerResult>>,
    blackboard: Option<Arc<dyn Blackboard>>,
    delegation_depth: u32,
    cancellation: CancellationToken,
    working_dir: PathBuf,
    mode: ExecutionMode,
}

impl WorkerContext {
    pub fn new(
        task_id: impl Into<String>,
        worker_kind: WorkerKind,
        working_dir: impl Into<PathBuf>,
        cancellation: CancellationToken,
    ) -> Self {
        let task_id = task_id.into();
        Self {
            plan_id: task_id.clone(),
            subtask_id: String::new(),
            worker_id: task_id.clone(),
            task_id,
            worker_kind,
            parent_task: String::new(),
            sibling_results: Arc::new(HashMap::new()),
            blackboard: None,
            delegation_depth: 0,
            cancellation,
            working_dir: working_dir.into(),
            mode: ExecutionMode::Standard,
        }
    }

    pub fn with_plan(mut self, plan_id: impl Into<String>, subtask_id: impl Into<String>) -> Self {
        self.plan_id = plan_id.into();
        self.subtask_id = subtask_id.into();
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_parent_task(mut self, parent_task: impl Into<String>) -> Self {
        self.parent_task = parent_task.into();
        self
    }

    pub fn with_sibling_results(mut self, results: Arc<HashMap<String, WorkerResult>>) -> Self {
        self.sibling_results = results;
        self
    }

    pub fn with_blackboard(mut self, blackboard: Arc<dyn Blackboard>) -> Self {
        self.blackboard = Some(blackboard);
        self
    }

    pub fn with_delegation_depth(mut self, depth: u32) -> Self {
        self.delegation_depth = depth;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn subtask_id(&self) -> &str {
        &self.subtask_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn parent_task(&self) -> &str {
        &self.parent_task
    }

    pub fn sibling_results(&self) -> &HashMap<String, WorkerResult> {
        &self.sibling_results
    }

    pub fn blackboard(&self) -> Option<&Arc<dyn Blackboard>> {
        self.blackboard.as_ref()
    }

    pub fn delegation_depth(&self) -> u32 {
        self.delegation_depth
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Derive the narrower context handed to a tool provider for one call.
    pub fn tool_context(&self, tool_call_id: impl Into<String>) -> ToolContext {
        ToolContext {
            task_id: self.task_id.clone(),
            worker_id: self.worker_id.clone(),
            worker_kind: self.worker_kind,
            working_dir: self.working_dir.clone(),
            tool_call_id: tool_call_id.into(),
            cancellation: self.cancellation.clone(),
            blackboard: self.blackboard.clone(),
        }
    }
}

impl ExecutionContext for WorkerContext {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn worker_kind(&self) -> WorkerKind {
        self.worker_kind
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

// ============================================================================
// ToolContext
// ============================================================================

/// Context for one tool call.
#[derive(Clone)]
pub struct ToolContext {
    task_id: String,
    worker_id: String,
    worker_kind: WorkerKind,
    working_dir: PathBuf,
    tool_call_id: String,
    cancellation: CancellationToken,
    blackboard: Option<Arc<dyn Blackboard>>,
}

impl ToolContext {
    pub fn tool_call_id(&self) -> &str {
        &self.tool_call_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn blackboard(&self) -> Option<&Arc<dyn Blackboard>> {
        self.blackboard.as_ref()
    }
}

impl ExecutionContext for ToolContext {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn worker_kind(&self) -> WorkerKind {
        self.worker_kind
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}
