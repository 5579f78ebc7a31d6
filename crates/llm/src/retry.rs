//! Transport Retry
//!
//! Model calls retry transient transport failures with exponential backoff
//! (`min(base * 2^attempt, cap)`, never shorter than a provider's
//! `retry_after`). A streamed call retries only while no output has arrived;
//! once output has streamed, a failure returns what was received instead.
//! Every wait and every in-flight call races the request's cancellation
//! signal.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use cascade_core::{CancellationToken, StreamChunk};

use crate::provider::LlmProvider;
use crate::streaming::StreamAccumulator;
use crate::types::{LlmError, LlmRequest, LlmResponse, LlmResult, StopReason};

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Backoff policy for transport-class failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u32>) -> Duration {
        let exp = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let backoff = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        let floor = retry_after_secs.map_or(0, |s| u64::from(s).saturating_mul(1_000));
        Duration::from_millis(backoff.max(floor))
    }
}

/// Result of a streamed call.
#[derive(Debug, Clone)]
pub struct StreamedResponse {
    pub response: LlmResponse,
    /// The transport failed after output had streamed; `response` holds what arrived
    pub partial: bool,
    /// Number of transport attempts made
    pub attempts: u32,
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn cancelled_error(token: Option<&CancellationToken>) -> LlmError {
    LlmError::Cancelled {
        reason: token
            .and_then(|t| t.reason())
            .unwrap_or_else(|| "cancelled".to_string()),
    }
}

/// Sleep for the backoff delay unless the request is cancelled first.
async fn backoff(
    policy: &RetryPolicy,
    attempt: u32,
    error: &LlmError,
    token: Option<&CancellationToken>,
) -> LlmResult<()> {
    let wait = policy.delay_for(attempt, error.retry_after());
    tracing::warn!(
        error = %error,
        attempt = attempt + 1,
        max_retries = policy.max_retries,
        wait_ms = wait.as_millis() as u64,
        "transient model error, retrying"
    );
    tokio::select! {
        _ = tokio::time::sleep(wait) => Ok(()),
        _ = wait_cancelled(token) => Err(cancelled_error(token)),
    }
}

/// Complete a request, retrying transient transport failures.
pub async fn complete_with_retry(
    provider: &dyn LlmProvider,
    request: LlmRequest,
    policy: &RetryPolicy,
) -> LlmResult<LlmResponse> {
    let token = request.cancellation.clone();
    let mut attempt = 0u32;
    loop {
        if token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(cancelled_error(token.as_ref()));
        }
        let result = tokio::select! {
            result = provider.complete(request.clone()) => result,
            _ = wait_cancelled(token.as_ref()) => Err(cancelled_error(token.as_ref())),
        };
        match result {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                backoff(policy, attempt, &e, token.as_ref()).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Stream a request, retrying transient failures only while nothing has
/// streamed. Chunks are forwarded to `observer` as they arrive.
pub async fn stream_with_retry(
    provider: &dyn LlmProvider,
    request: LlmRequest,
    policy: &RetryPolicy,
    observer: Option<mpsc::Sender<StreamChunk>>,
) -> LlmResult<StreamedResponse> {
    let token = request.cancellation.clone();
    let mut attempt = 0u32;
    loop {
        if token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(cancelled_error(token.as_ref()));
        }

        let (tx, mut rx) = mpsc::channel::<StreamChunk>(64);
        let mut acc = StreamAccumulator::new(provider.model());
        let call = provider.stream(request.clone(), tx);
        tokio::pin!(call);

        let mut rx_open = true;
        let result = loop {
            tokio::select! {
                chunk = rx.recv(), if rx_open => match chunk {
                    Some(chunk) => {
                        acc.push(&chunk);
                        if let Some(observer) = &observer {
                            let _ = observer.send(chunk).await;
                        }
                    }
                    None => rx_open = false,
                },
                result = &mut call => break result,
                _ = wait_cancelled(token.as_ref()) => break Err(cancelled_error(token.as_ref())),
            }
        };
        while let Ok(chunk) = rx.try_recv() {
            acc.push(&chunk);
            if let Some(observer) = &observer {
                let _ = observer.send(chunk).await;
            }
        }

        match result {
            Ok(response) => {
                return Ok(StreamedResponse {
                    response,
                    partial: false,
                    attempts: attempt + 1,
                })
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) if acc.has_output() => {
                tracing::warn!(error = %e, "stream failed after output; keeping partial response");
                return Ok(StreamedResponse {
                    response: acc.into_response(Some(StopReason::Interrupted)),
                    partial: true,
                    attempts: attempt + 1,
                });
            }
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                backoff(policy, attempt, &e, token.as_ref()).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
