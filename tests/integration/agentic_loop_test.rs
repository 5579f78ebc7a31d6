//! Agentic Loop Integration Tests
//!
//! Drives `AgenticToolLoop` end to end through the tag protocol:
//! - batching of read-only calls within one turn
//! - cancellation between steps
//! - loop detection with the audit log attached

use std::sync::Arc;

use cascade_agents::services::orchestrator::{AgenticToolLoop, LoopConfig};
use cascade_agents::storage::{InvocationRecord, JsonlInvocationRecorder};
use cascade_core::{CancellationToken, TerminationReason, WorkerContext, WorkerKind, WorkerStatus};
use cascade_llm::ToolCallMode;
use cascade_tools::ToolCatalog;
use serde_json::Value;

use crate::support::{auth_error, completion, specs, text, MemoryTools, ScriptedModel};

fn build(model: Arc<ScriptedModel>, tools: Arc<MemoryTools>) -> AgenticToolLoop {
    AgenticToolLoop::builder(model, tools, Arc::new(ToolCatalog::new(specs())))
        .config(LoopConfig {
            stream: false,
            ..LoopConfig::default()
        })
        .build()
}

fn ctx(token: CancellationToken) -> WorkerContext {
    WorkerContext::new("task-1", WorkerKind::Coder, ".", token).with_worker_id("coder-1")
}

// ============================================================================
// Turn batching
// ============================================================================

#[tokio::test]
async fn test_three_read_only_calls_run_in_one_step() {
    let model = ScriptedModel::new(vec![
        text(
            "<read_file><path>a.rs</path></read_file>\n\
             <search_files><path>src</path><regex>fn main</regex></search_files>\n\
             <read_file><path>b.rs</path></read_file>",
        ),
        completion("Read both files."),
    ]);
    let tools = MemoryTools::new();
    let agent = build(model.clone(), tools.clone());

    let result = agent.run("Survey the crate", &ctx(CancellationToken::new())).await;

    assert_eq!(result.status, WorkerStatus::Success);
    assert_eq!(model.request_count(), 2);
    let calls = tools.calls();
    assert_eq!(calls.len(), 3);
    let mut paths: Vec<&str> = calls
        .iter()
        .filter(|(name, _)| name == "read_file")
        .filter_map(|(_, args)| args.get("path").and_then(Value::as_str))
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["a.rs", "b.rs"]);
}

#[tokio::test]
async fn test_read_then_write_executes_only_the_read() {
    let model = ScriptedModel::new(vec![
        text(
            "<read_file><path>a.rs</path></read_file>\n\
             <write_to_file><path>a.rs</path><content>new</content></write_to_file>",
        ),
        completion("Looked first."),
    ]);
    let tools = MemoryTools::new();
    let agent = build(model, tools.clone());

    let result = agent.run("Rewrite a.rs", &ctx(CancellationToken::new())).await;

    assert_eq!(result.status, WorkerStatus::Success);
    assert_eq!(tools.call_names(), vec!["read_file"]);
    assert!(result.artifacts.is_empty());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_mid_run_keeps_partial_result() {
    let model = ScriptedModel::new(vec![
        text("<read_file><path>a.rs</path></read_file>"),
        text("<execute_command><command>cargo build</command></execute_command>"),
    ]);
    let tools = MemoryTools::cancelling_on("read_file");
    let agent = build(model.clone(), tools.clone());

    let result = agent.run("Build it", &ctx(CancellationToken::new())).await;

    assert_eq!(result.termination, TerminationReason::Cancelled);
    assert_eq!(result.status, WorkerStatus::Partial);
    assert_eq!(tools.call_names(), vec!["read_file"]);
    assert_eq!(model.request_count(), 1);
}

// ============================================================================
// Failure modes
// ============================================================================

#[tokio::test]
async fn test_model_error_fails_without_tool_progress() {
    let model = ScriptedModel::with_results(vec![Err(auth_error())]);
    let agent = build(model, MemoryTools::new());

    let result = agent.run("Anything", &ctx(CancellationToken::new())).await;

    assert_eq!(result.status, WorkerStatus::Failed);
    assert_eq!(result.termination, TerminationReason::ModelError);
    assert!(result.error.unwrap().contains("invalid api key"));
}

#[tokio::test]
async fn test_loop_detection_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("invocations.jsonl");
    let call = "<execute_command><command>ls</command></execute_command>";
    let model = ScriptedModel::new(vec![text(call), text(call), text(call), text("Listed twice.")]);
    let tools = MemoryTools::new();
    let agent = AgenticToolLoop::builder(model.clone(), tools.clone(), Arc::new(ToolCatalog::new(specs())))
        .config(LoopConfig {
            stream: false,
            ..LoopConfig::default()
        })
        .recorder(Arc::new(JsonlInvocationRecorder::new(&log_path)))
        .build();

    let result = agent.run("List files", &ctx(CancellationToken::new())).await;

    assert_eq!(result.termination, TerminationReason::LoopDetected);
    assert_eq!(result.output, "Listed twice.");
    assert_eq!(tools.call_names().len(), 2);
    assert_eq!(model.last_request().unwrap().tool_call_mode, ToolCallMode::None);

    let content = std::fs::read_to_string(&log_path).unwrap();
    let records: Vec<InvocationRecord> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].worker_id, "coder-1");
    assert_eq!(records[0].termination, TerminationReason::LoopDetected);
    assert_eq!(records[0].tool_calls, 2);
}
