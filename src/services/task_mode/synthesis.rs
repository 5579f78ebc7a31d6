//! Final answer compilation
//!
//! Turns the terminal outputs of every sub-task into one answer, either with
//! a synthesis call to the model or by plain concatenation.

use std::sync::Arc;

use async_trait::async_trait;

use cascade_core::CancellationToken;
use cascade_llm::{complete_with_retry, LlmProvider, LlmRequest, Message, RetryPolicy};

use crate::models::{SubTask, SubTaskStatus, TaskPlan};
use crate::utils::error::{AppError, AppResult};

const SYNTHESIS_SYSTEM_PROMPT: &str = "You combine the results of several sub-tasks into one \
coherent final answer for the overall goal. Use only the information in the results. \
Point out any sub-task that failed and what is missing because of it. Do not mention \
sub-task ids unless they help the reader.";

const SYNTHESIS_MAX_TOKENS: u32 = 4096;

/// Per-result cap inside the synthesis prompt.
const RESULT_MAX_CHARS: usize = 6000;

#[async_trait]
pub trait ResultCompiler: Send + Sync {
    async fn compile(&self, plan: &TaskPlan, cancel: &CancellationToken) -> AppResult<String>;

    fn name(&self) -> &str;
}

// ============================================================================
// Concatenation
// ============================================================================

/// Deterministic compilation: one section per sub-task, in plan order.
pub struct ConcatenationCompiler;

#[async_trait]
impl ResultCompiler for ConcatenationCompiler {
    async fn compile(&self, plan: &TaskPlan, _cancel: &CancellationToken) -> AppResult<String> {
        Ok(concatenate(plan))
    }

    fn name(&self) -> &str {
        "ConcatenationCompiler"
    }
}

fn section_body(subtask: &SubTask) -> String {
    let output = subtask
        .result
        .as_ref()
        .map(|r| r.output.trim())
        .filter(|o| !o.is_empty());
    match (subtask.status, output) {
        (SubTaskStatus::Completed, Some(output)) => output.to_string(),
        (SubTaskStatus::Completed, None) => "(no output)".to_string(),
        (_, output) => {
            let reason = subtask.error.as_deref().unwrap_or("not run");
            match output {
                Some(partial) => format!("FAILED: {}\n\nPartial output:\n{}", reason, partial),
                None => format!("FAILED: {}", reason),
            }
        }
    }
}

pub fn concatenate(plan: &TaskPlan) -> String {
    plan.subtasks
        .iter()
        .map(|s| format!("## {} ({})\n\n{}", s.id, s.status, section_body(s)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ============================================================================
// LLM synthesis
// ============================================================================

pub struct LlmSynthesisCompiler {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
}

impl LlmSynthesisCompiler {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn prompt(plan: &TaskPlan) -> String {
        let mut prompt = format!("Overall goal:\n{}\n\nSub-task results:\n", plan.task);
        for subtask in &plan.subtasks {
            let body: String = section_body(subtask).chars().take(RESULT_MAX_CHARS).collect();
            prompt.push_str(&format!(
                "\n### [{}] {} ({})\n{}\n",
                subtask.id, subtask.description, subtask.status, body
            ));
        }
        prompt.push_str("\nWrite the final answer.");
        prompt
    }
}

#[async_trait]
impl ResultCompiler for LlmSynthesisCompiler {
    async fn compile(&self, plan: &TaskPlan, cancel: &CancellationToken) -> AppResult<String> {
        if cancel.is_cancelled() {
            return Err(AppError::cancelled(cancel.reason().unwrap_or_default()));
        }
        let request = LlmRequest::new(vec![Message::user(Self::prompt(plan))])
            .with_system(SYNTHESIS_SYSTEM_PROMPT)
            .with_temperature(0.3)
            .with_max_tokens(SYNTHESIS_MAX_TOKENS)
            .with_cancellation(cancel.clone())
            .without_tools();
        let response = complete_with_retry(self.provider.as_ref(), request, &self.retry).await?;
        let text = response.text_or_empty().trim().to_string();
        if text.is_empty() {
            return Err(AppError::internal("synthesis call returned no text"));
        }
        Ok(text)
    }

    fn name(&self) -> &str {
        "LlmSynthesisCompiler"
    }
}

/// Compile with `compiler`, falling back to concatenation on any error.
pub async fn compile_with_fallback(
    compiler: &dyn ResultCompiler,
    plan: &TaskPlan,
    cancel: &CancellationToken,
) -> String {
    match compiler.compile(plan, cancel).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(
                plan_id = %plan.id,
                compiler = compiler.name(),
                error = %e,
                "result compilation failed; concatenating outputs"
            );
            concatenate(plan)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::{TerminationReason, WorkerKind, WorkerResult, WorkerStatus};
    use cascade_llm::{LlmError, LlmResponse, LlmResult};
    use std::sync::Mutex;

    fn finished_plan() -> TaskPlan {
        let mut a = SubTask::new("a", "Write the parser", WorkerKind::Coder);
        a.complete(WorkerResult::new(WorkerStatus::Success, TerminationReason::Completed).with_output("parser written"));
        let mut b = SubTask::new("b", "Review it", WorkerKind::Reviewer).with_max_attempts(1);
        b.status = SubTaskStatus::InProgress;
        b.record_failure(
            WorkerResult::new(WorkerStatus::Failed, TerminationReason::ModelError)
                .with_output("half a review")
                .with_error("rate limited"),
        );
        TaskPlan::new("Build a parser", vec![a, b])
    }

    struct OneReply {
        reply: Mutex<Option<LlmResult<LlmResponse>>>,
    }

    #[async_trait]
    impl LlmProvider for OneReply {
        fn name(&self) -> &str {
            "one"
        }

        fn model(&self) -> &str {
            "one-1"
        }

        fn supports_tools(&self) -> bool {
            false
        }

        async fn complete(&self, _request: LlmRequest) -> LlmResult<LlmResponse> {
            self.reply
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(LlmResponse::text("", "one-1")))
        }
    }

    #[test]
    fn test_concatenate_sections() {
        let text = concatenate(&finished_plan());
        assert!(text.starts_with("## a (completed)\n\nparser written"));
        assert!(text.contains("## b (failed)\n\nFAILED: rate limited"));
        assert!(text.contains("Partial output:\nhalf a review"));
    }

    #[tokio::test]
    async fn test_llm_synthesis() {
        let compiler = LlmSynthesisCompiler::new(Arc::new(OneReply {
            reply: Mutex::new(Some(Ok(LlmResponse::text("  The parser is done.  ", "one-1")))),
        }));
        let output = compiler.compile(&finished_plan(), &CancellationToken::new()).await.unwrap();
        assert_eq!(output, "The parser is done.");
    }

    #[tokio::test]
    async fn test_fallback_on_error() {
        let compiler = LlmSynthesisCompiler::new(Arc::new(OneReply {
            reply: Mutex::new(Some(Err(LlmError::AuthenticationFailed {
                message: "bad key".to_string(),
            }))),
        }));
        let plan = finished_plan();
        let output = compile_with_fallback(&compiler, &plan, &CancellationToken::new()).await;
        assert_eq!(output, concatenate(&plan));
    }

    #[tokio::test]
    async fn test_cancelled_synthesis_is_skipped() {
        let token = CancellationToken::new();
        token.cancel("user stop");
        let compiler = LlmSynthesisCompiler::new(Arc::new(OneReply {
            reply: Mutex::new(None),
        }));
        let err = compiler.compile(&finished_plan(), &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
