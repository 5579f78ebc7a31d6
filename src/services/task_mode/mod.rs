//! Task Mode
//!
//! Executes a `TaskPlan`:
//! - round-based DAG scheduling with retry and forward progress
//! - worker dispatch to the tool loop or a single-shot call
//! - final answer compilation
//! - the submit/cancel service wrapping all of it

pub mod scheduler;
pub mod service;
pub mod synthesis;
pub mod worker_runner;

pub use scheduler::{
    plan_rounds, ready_set, unknown_dependencies, ExecutionRound, ScheduleReport, SchedulerConfig,
    TaskScheduler,
};
pub use service::{PlanHandle, PlanService};
pub use synthesis::{
    compile_with_fallback, concatenate, ConcatenationCompiler, LlmSynthesisCompiler, ResultCompiler,
};
pub use worker_runner::{DefaultWorkerRunner, WorkerRunner};
