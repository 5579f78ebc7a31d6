//! Single-Shot Worker Call
//!
//! Tool-less worker kinds are served by one model call. When that call fails
//! with a parse/format-shaped error (empty output, failed validation, an
//! unparseable provider response) it is retried exactly once with the failure
//! appended and a lower temperature. Transport failures are never retried
//! here; the transport layer already did that.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use cascade_core::{
    ExecutionContext, TerminationReason, TokenCounts, WorkerContext, WorkerResult, WorkerStatus,
};
use cascade_llm::{complete_with_retry, LlmError, LlmProvider, LlmRequest, Message, RetryPolicy};

/// Confidence ceiling for an answer accepted on the first attempt.
pub const FIRST_ATTEMPT_CONFIDENCE: f32 = 0.9;
/// Confidence ceiling for an answer accepted after self-correction.
pub const CORRECTED_CONFIDENCE: f32 = 0.7;

const FORMAT_KEYWORDS: &[&str] = &[
    "parse",
    "json",
    "format",
    "invalid",
    "malformed",
    "schema",
    "expected",
    "unexpected",
    "empty response",
    "missing",
    "validation",
];

const TRANSPORT_KEYWORDS: &[&str] = &[
    "auth",
    "unauthorized",
    "forbidden",
    "api key",
    "rate limit",
    "rate-limit",
    "too many requests",
    "429",
    "network",
    "connection",
    "timed out",
    "timeout",
    "quota",
    "unavailable",
];

/// Whether a failure message looks like a content/format problem the model
/// could fix by trying again.
pub fn is_correctable(message: &str) -> bool {
    let lower = message.to_lowercase();
    if TRANSPORT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return false;
    }
    FORMAT_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn default_temperature() -> f32 {
    0.7
}

fn default_correction_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    8_192
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleShotConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Used for the one corrective retry
    #[serde(default = "default_correction_temperature")]
    pub correction_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for SingleShotConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            correction_temperature: default_correction_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Checks model output. `Err` carries the reason fed back on correction.
pub type OutputValidator = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

enum AttemptError {
    Cancelled(String),
    Transport(String),
    Format { message: String, output: String },
}

struct Attempt {
    text: String,
}

/// Runs one prompt against a provider with a single bounded correction.
pub struct SingleShotRunner {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    config: SingleShotConfig,
    system: Option<String>,
    validator: Option<OutputValidator>,
}

impl SingleShotRunner {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
            config: SingleShotConfig::default(),
            system: None,
            validator: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: SingleShotConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_validator(mut self, validator: OutputValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    async fn attempt(
        &self,
        prompt: String,
        temperature: f32,
        ctx: &WorkerContext,
        tokens: &mut TokenCounts,
    ) -> Result<Attempt, AttemptError> {
        let mut request = LlmRequest::new(vec![Message::user(prompt)])
            .with_temperature(temperature)
            .with_max_tokens(self.config.max_tokens)
            .with_cancellation(ctx.cancellation().clone())
            .without_tools();
        if let Some(system) = &self.system {
            request = request.with_system(system.clone());
        }

        let response = match complete_with_retry(self.provider.as_ref(), request, &self.retry).await {
            Ok(response) => response,
            Err(LlmError::Cancelled { reason }) => return Err(AttemptError::Cancelled(reason)),
            Err(e) => {
                let message = e.to_string();
                if !e.is_transport() && (matches!(e, LlmError::ParseError { .. }) || is_correctable(&message)) {
                    return Err(AttemptError::Format {
                        message,
                        output: String::new(),
                    });
                }
                return Err(AttemptError::Transport(message));
            }
        };
        tokens.add(response.usage.input_tokens, response.usage.output_tokens);

        let text = response.text_or_empty().trim().to_string();
        if text.is_empty() {
            return Err(AttemptError::Format {
                message: "empty response".to_string(),
                output: text,
            });
        }
        if let Some(validator) = &self.validator {
            if let Err(message) = validator(&text) {
                return Err(AttemptError::Format { message, output: text });
            }
        }
        Ok(Attempt { text })
    }

    /// Run `prompt` for the worker in `ctx`.
    pub async fn run(&self, prompt: &str, ctx: &WorkerContext) -> WorkerResult {
        self.run_counted(prompt, ctx).await.0
    }

    /// Like `run`, also returning the number of attempts made (1 or 2).
    pub async fn run_counted(&self, prompt: &str, ctx: &WorkerContext) -> (WorkerResult, u32) {
        let started = Instant::now();
        let mut tokens = TokenCounts::default();
        let model = self.provider.model().to_string();

        let finish = |result: WorkerResult, tokens: TokenCounts| {
            result
                .with_tokens(tokens)
                .with_model(model.clone())
                .with_duration(started.elapsed())
        };

        let first = self
            .attempt(prompt.to_string(), self.config.temperature, ctx, &mut tokens)
            .await;
        let (message, previous) = match first {
            Ok(attempt) => {
                let result = WorkerResult::new(WorkerStatus::Success, TerminationReason::Completed)
                    .with_output(attempt.text)
                    .with_confidence(FIRST_ATTEMPT_CONFIDENCE);
                return (finish(result, tokens), 1);
            }
            Err(AttemptError::Cancelled(reason)) => {
                let result = WorkerResult::new(WorkerStatus::Failed, TerminationReason::Cancelled).with_error(reason);
                return (finish(result, tokens), 1);
            }
            Err(AttemptError::Transport(message)) => {
                tracing::warn!(worker_id = %ctx.worker_id(), error = %message, "single-shot call failed");
                let result = WorkerResult::new(WorkerStatus::Failed, TerminationReason::ModelError).with_error(message);
                return (finish(result, tokens), 1);
            }
            Err(AttemptError::Format { message, output }) => (message, output),
        };

        tracing::info!(worker_id = %ctx.worker_id(), error = %message, "retrying single-shot call with correction");
        let mut corrected_prompt = format!(
            "{}\n\nYour previous response could not be used: {}.",
            prompt, message
        );
        if !previous.is_empty() {
            corrected_prompt.push_str(&format!("\n\nPrevious response:\n{}", previous));
        }
        corrected_prompt.push_str("\n\nRespond again and follow the required format exactly.");

        let result = match self
            .attempt(corrected_prompt, self.config.correction_temperature, ctx, &mut tokens)
            .await
        {
            Ok(attempt) => finish(
                WorkerResult::new(WorkerStatus::Success, TerminationReason::Completed)
                    .with_output(attempt.text)
                    .with_confidence(CORRECTED_CONFIDENCE),
                tokens,
            ),
            Err(AttemptError::Cancelled(reason)) => finish(
                WorkerResult::new(WorkerStatus::Failed, TerminationReason::Cancelled).with_error(reason),
                tokens,
            ),
            Err(AttemptError::Transport(message)) => finish(
                WorkerResult::new(WorkerStatus::Failed, TerminationReason::ModelError).with_error(message),
                tokens,
            ),
            Err(AttemptError::Format { message, output }) => finish(
                WorkerResult::new(WorkerStatus::Failed, TerminationReason::InvalidOutput)
                    .with_output(output)
                    .with_error(format!("output still invalid after correction: {}", message)),
                tokens,
            ),
        };
        (result, 2)
    }
}
