//! Invocation Audit Log
//!
//! Every finished worker invocation is handed to an `InvocationRecorder`
//! for audit and cost accounting. The JSONL recorder appends one record per
//! line; nothing in the core reads the log back.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use cascade_core::{TerminationReason, TokenCounts, WorkerKind, WorkerStatus};

use crate::utils::error::AppResult;

/// Summary of one finished worker invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRecord {
    pub id: String,
    pub task_id: String,
    pub worker_id: String,
    pub worker_kind: WorkerKind,
    pub model: String,
    pub status: WorkerStatus,
    pub termination: TerminationReason,
    pub confidence: f32,
    pub steps: u32,
    pub tool_calls: u32,
    pub tokens: TokenCounts,
    pub compactions: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl InvocationRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Persistence sink for finished invocations.
#[async_trait]
pub trait InvocationRecorder: Send + Sync {
    async fn record(&self, record: &InvocationRecord) -> AppResult<()>;
}

/// Drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

#[async_trait]
impl InvocationRecorder for NoopRecorder {
    async fn record(&self, _record: &InvocationRecord) -> AppResult<()> {
        Ok(())
    }
}

/// Appends records as JSON lines to a file.
#[derive(Debug)]
pub struct JsonlInvocationRecorder {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlInvocationRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl InvocationRecorder for JsonlInvocationRecorder {
    async fn record(&self, record: &InvocationRecord) -> AppResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> InvocationRecord {
        let now = Utc::now();
        InvocationRecord {
            id: id.to_string(),
            task_id: "task".into(),
            worker_id: "w1".into(),
            worker_kind: WorkerKind::Coder,
            model: "m".into(),
            status: WorkerStatus::Success,
            termination: TerminationReason::Completed,
            confidence: 0.9,
            steps: 3,
            tool_calls: 2,
            tokens: TokenCounts::new(100, 50),
            compactions: 0,
            started_at: now,
            finished_at: now + chrono::Duration::milliseconds(250),
        }
    }

    #[tokio::test]
    async fn test_jsonl_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonlInvocationRecorder::new(dir.path().join("audit/invocations.jsonl"));
        recorder.record(&record("a")).await.unwrap();
        recorder.record(&record("b")).await.unwrap();

        let content = std::fs::read_to_string(recorder.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: InvocationRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.id, "b");
        assert_eq!(parsed.duration_ms(), 250);
        assert!(lines[0].contains("\"workerKind\":\"coder\""));
    }

    #[tokio::test]
    async fn test_noop_recorder() {
        assert!(NoopRecorder.record(&record("x")).await.is_ok());
    }
}
