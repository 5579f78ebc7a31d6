//! Plan Service Integration Tests
//!
//! Runs whole plans through `PlanService` with scripted models:
//! - retry rounds and forward progress on a small DAG
//! - dependency exhaustion on a cycle
//! - cancellation of an in-flight plan

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use cascade_agents::services::task_mode::PlanService;
use cascade_agents::storage::{CascadeConfig, NoopRecorder};
use cascade_agents::{AppError, SubTask, SubTaskStatus, TaskPlan};
use cascade_core::{AgentEvent, TerminationReason, WorkerKind, WorkerStatus};

use crate::support::{auth_error, text, MemoryRecorder, MemoryTools, RoutedModel};

fn config() -> CascadeConfig {
    let mut config = CascadeConfig::default();
    config.agent.stream = false;
    config.scheduler.llm_synthesis = false;
    config
}

async fn service(model: Arc<RoutedModel>) -> PlanService {
    PlanService::from_config(model, MemoryTools::new(), &config(), ".", Arc::new(NoopRecorder))
        .await
        .unwrap()
}

fn round_ids(events: &[AgentEvent]) -> Vec<Vec<String>> {
    events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::RoundStarted { subtask_ids, .. } => Some(subtask_ids.clone()),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Retry and forward progress
// ============================================================================

#[tokio::test]
async fn test_failing_subtask_retried_before_dependent_runs() {
    let model = RoutedModel::new(vec![
        ("alpha", vec![Err(auth_error()), Err(auth_error())]),
        ("beta", vec![]),
        ("gamma", vec![]),
    ]);
    let service = service(model.clone()).await;
    let plan = TaskPlan::new(
        "Build the feature",
        vec![
            SubTask::new("a", "Do alpha", WorkerKind::Coder),
            SubTask::new("b", "Do beta", WorkerKind::Researcher),
            SubTask::new("c", "Do gamma", WorkerKind::Coder).with_dependencies(["a", "b"]),
        ],
    );

    let mut handle = service.submit(plan).await.unwrap();
    let events = handle.take_events().unwrap();
    let result = handle.wait().await.unwrap();
    let events: Vec<AgentEvent> = events.collect().await;

    assert!(result.success);
    assert_eq!(result.completed, 3);
    assert_eq!(result.rounds, 4);
    assert_eq!(result.subtask("a").unwrap().attempts, 2);
    assert_eq!(result.subtask("b").unwrap().attempts, 0);
    assert!(result.output.contains("gamma done"));

    let log = model.log();
    let mut first_round = log[..2].to_vec();
    first_round.sort();
    assert_eq!(first_round, vec!["alpha", "beta"]);
    assert_eq!(&log[2..], &["alpha", "alpha", "gamma"]);

    assert_eq!(
        round_ids(&events),
        vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["a".to_string()],
            vec!["a".to_string()],
            vec!["c".to_string()],
        ]
    );
    assert_eq!(events.first().map(|e| e.kind()), Some("plan_started"));
    assert!(matches!(
        events.last(),
        Some(AgentEvent::PlanCompleted { success: true, completed: 3, .. })
    ));
}

#[tokio::test]
async fn test_exhausted_subtask_does_not_block_dependents() {
    let model = RoutedModel::new(vec![
        ("alpha", vec![Err(auth_error()), Err(auth_error()), Err(auth_error())]),
        ("gamma", vec![]),
    ]);
    let service = service(model).await;
    let plan = TaskPlan::new(
        "Build the feature",
        vec![
            SubTask::new("a", "Do alpha", WorkerKind::Coder),
            SubTask::new("c", "Do gamma", WorkerKind::Coder).with_dependencies(["a"]),
        ],
    );

    let result = service.submit(plan).await.unwrap().wait().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.failed, 1);
    assert_eq!(result.subtask("a").unwrap().status, SubTaskStatus::Failed);
    assert_eq!(result.subtask("a").unwrap().attempts, 3);
    assert_eq!(result.subtask("c").unwrap().status, SubTaskStatus::Completed);
    assert!(result.output.contains("## a (failed)"));
}

#[tokio::test]
async fn test_single_shot_kind_skips_tool_loop() {
    let model = RoutedModel::new(vec![("delta", vec![Ok(crate::support::text("Release notes."))])]);
    let service = service(model).await;
    let plan = TaskPlan::new("Ship", vec![SubTask::new("w", "Write delta notes", WorkerKind::Writer)]);

    let result = service.submit(plan).await.unwrap().wait().await.unwrap();

    let writer = result.subtask("w").unwrap();
    assert_eq!(writer.status, SubTaskStatus::Completed);
    assert_eq!(writer.result.as_ref().unwrap().output, "Release notes.");
}

#[tokio::test]
async fn test_single_shot_invocations_are_recorded() {
    let model = RoutedModel::new(vec![
        ("delta", vec![Ok(text("")), Ok(text("Release notes."))]),
        ("epsilon", vec![Ok(text("Changelog."))]),
    ]);
    let recorder = MemoryRecorder::new();
    let service = PlanService::from_config(model, MemoryTools::new(), &config(), ".", recorder.clone())
        .await
        .unwrap();
    let plan = TaskPlan::new(
        "Ship",
        vec![
            SubTask::new("w", "Write delta notes", WorkerKind::Writer),
            SubTask::new("x", "Write epsilon log", WorkerKind::Writer).with_dependencies(["w"]),
        ],
    )
    .with_task_id("task-notes");

    let result = service.submit(plan).await.unwrap().wait().await.unwrap();
    assert!(result.success);

    let records = recorder.records();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.task_id, "task-notes");
        assert_eq!(record.worker_kind, WorkerKind::Writer);
        assert_eq!(record.status, WorkerStatus::Success);
        assert_eq!(record.termination, TerminationReason::Completed);
        assert_eq!(record.model, crate::support::MODEL);
        assert_eq!(record.tool_calls, 0);
        assert!(record.finished_at >= record.started_at);
    }
    assert_eq!(records[0].steps, 2);
    assert!(records[0].confidence < records[1].confidence);
    assert_eq!(records[1].steps, 1);
    assert_ne!(records[0].id, records[1].id);
}

// ============================================================================
// Dependency exhaustion
// ============================================================================

#[tokio::test]
async fn test_cycle_aborts_plan() {
    let service = service(RoutedModel::new(vec![])).await;
    let plan = TaskPlan::new(
        "Impossible",
        vec![
            SubTask::new("a", "Do alpha", WorkerKind::Coder),
            SubTask::new("b", "Do beta", WorkerKind::Coder).with_dependencies(["c"]),
            SubTask::new("c", "Do gamma", WorkerKind::Coder).with_dependencies(["b"]),
        ],
    );

    let mut handle = service.submit(plan).await.unwrap();
    let events = handle.take_events().unwrap();
    let err = handle.wait().await.unwrap_err();
    let events: Vec<AgentEvent> = events.collect().await;

    assert!(matches!(err, AppError::DependencyExhausted(_)));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::Error { code: Some(code), .. } if code == "plan_aborted")));
    assert!(matches!(
        events.last(),
        Some(AgentEvent::PlanCompleted { success: false, .. })
    ));
    assert!(service.running().await.is_empty());
}

#[tokio::test]
async fn test_invalid_plan_rejected_on_submit() {
    let service = service(RoutedModel::new(vec![])).await;
    let plan = TaskPlan::new(
        "Dup",
        vec![
            SubTask::new("a", "one", WorkerKind::Coder),
            SubTask::new("a", "two", WorkerKind::Coder),
        ],
    );
    assert!(matches!(service.submit(plan).await, Err(AppError::Validation(_))));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_in_flight_plan() {
    let model = RoutedModel::with_hanging(vec![], &["slow"]);
    let service = service(model.clone()).await;
    let plan = TaskPlan::new("Wait forever", vec![SubTask::new("s", "Do slow work", WorkerKind::Coder)])
        .with_task_id("task-slow");

    let handle = service.submit(plan).await.unwrap();
    assert_eq!(handle.task_id, "task-slow");

    let duplicate = TaskPlan::new("Again", vec![SubTask::new("x", "Do slow work", WorkerKind::Coder)])
        .with_task_id("task-slow");
    assert!(matches!(service.submit(duplicate).await, Err(AppError::Validation(_))));

    for _ in 0..200 {
        if !model.log().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(service.cancel("task-slow", "user stop").await);
    assert!(!service.cancel("task-unknown", "user stop").await);

    let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap()
        .unwrap();

    assert!(result.cancelled);
    assert!(!result.success);
    let slow = result.subtask("s").unwrap();
    assert_eq!(slow.status, SubTaskStatus::Failed);
    assert_eq!(slow.result.as_ref().unwrap().termination, TerminationReason::Cancelled);
    assert!(service.running().await.is_empty());
}
