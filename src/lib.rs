//! Cascade Agents
//!
//! Multi-agent execution core:
//! - an agentic tool loop that drives one worker through a model and tools
//! - a round-based scheduler that runs a dependency-ordered plan of sub-tasks
//! - context compaction, loop detection, and permission gating around both
//!
//! The workspace crates supply the shared pieces: `cascade_core` (worker
//! types, cancellation, events), `cascade_llm` (provider trait and retry),
//! and `cascade_tools` (tool provider trait and call protocols).

pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use models::{PlanExecutionResult, SubTask, SubTaskStatus, TaskPlan};
pub use services::orchestrator::{AgenticToolLoop, AgenticToolLoopBuilder, LoopConfig, SingleShotRunner};
pub use services::task_mode::{PlanHandle, PlanService, SchedulerConfig, TaskScheduler};
pub use storage::{CascadeConfig, InvocationRecord, InvocationRecorder, JsonlInvocationRecorder, NoopRecorder};
pub use utils::error::{AppError, AppResult};
