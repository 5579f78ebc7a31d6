//! Agentic Tool Loop
//!
//! Drives one worker invocation: call the model, parse its turn, gate and run
//! the requested tools, feed the outcomes back, and repeat until the model
//! signals completion or a safety limit trips.
//!
//! Each step runs, in order: cancellation check, wall-clock check, step
//! limit, proactive compaction, the model call, parsing (primary protocol,
//! then prose extraction, then legacy JSON), completion handling, the
//! no-tool grace ladder, repetition detection, and gated tool execution.
//!
//! Terminal trips (repetition, mistake limit, step limit) ask the model for a
//! final tools-disabled summary. Cancellation and timeout return at once with
//! whatever has been produced.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use cascade_core::{
    AgentEvent, EventSink, ExecutionContext, NullEventSink, TerminationReason, TokenCounts,
    WorkerContext, WorkerResult, WorkerStatus,
};
use cascade_llm::{
    complete_with_retry, stream_with_retry, LlmError, LlmProvider, LlmRequest, LlmResponse,
    RetryPolicy, ToolCallMode, ToolDefinition,
};
use cascade_tools::{
    InvocationOrigin, ParsedTurn, ProseToolExtractor, ProseToolKeys, ResponseParser,
    StructuredProtocol, TagProtocol, ToolCallProtocol, ToolCatalog, ToolInvocation, ToolOutcome,
    ToolProvider, COMPLETION_RESULT_PARAM, COMPLETION_TOOL,
};

use crate::services::context::ConversationState;
use crate::services::core::{compact_if_needed, CompactionConfig, ContextCompactor, LlmSummaryCompactor};
use crate::storage::invocations::{InvocationRecord, InvocationRecorder, NoopRecorder};

use super::gateway::{GatewayConfig, GatewaySession, ToolExecutionGateway};
use super::loop_detector::{DetectorConfig, DetectorVerdict, RepetitionDetector};
use super::permissions::{
    ApprovalHandler, AutoApprove, CapabilityPermissionPolicy, PermissionLevel, PermissionPolicy,
};

/// Confidence of a completion signalled through the primary protocol.
pub const PROTOCOL_COMPLETION_CONFIDENCE: f32 = 0.9;
/// Confidence of a completion recovered from prose or legacy JSON.
pub const FALLBACK_COMPLETION_CONFIDENCE: f32 = 0.7;
/// Confidence of free text accepted after the no-tool ceiling.
pub const FREE_TEXT_CONFIDENCE: f32 = 0.5;
/// Confidence of a best-effort result after a terminal trip.
pub const PARTIAL_CONFIDENCE: f32 = 0.3;

const SUMMARY_TIMEOUT: Duration = Duration::from_secs(120);
const SIBLING_OUTPUT_MAX_CHARS: usize = 2_000;

// ============================================================================
// LoopConfig
// ============================================================================

fn default_max_steps() -> u32 {
    40
}

fn default_no_tool_grace() -> u32 {
    2
}

fn default_no_tool_ceiling() -> u32 {
    4
}

fn default_mistake_limit() -> u32 {
    5
}

fn default_max_tokens() -> u32 {
    8_192
}

fn default_stream() -> bool {
    true
}

fn default_legacy_json() -> bool {
    true
}

/// Limits and protocol choices for one loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Model calls before the loop stops and summarizes
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Gentle reminders before a no-tool turn counts as a mistake
    #[serde(default = "default_no_tool_grace")]
    pub no_tool_grace: u32,
    /// Consecutive no-tool turns after which free text is accepted as final
    #[serde(default = "default_no_tool_ceiling")]
    pub no_tool_ceiling: u32,
    #[serde(default = "default_mistake_limit")]
    pub mistake_limit: u32,
    /// Wall-clock budget override. `None` uses the worker kind's default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Stream model calls so interrupted output is kept
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub prose_keys: ProseToolKeys,
    #[serde(default = "default_legacy_json")]
    pub legacy_json: bool,
    /// Use the tag protocol even when the transport supports structured calls
    #[serde(default)]
    pub force_tag_protocol: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            no_tool_grace: default_no_tool_grace(),
            no_tool_ceiling: default_no_tool_ceiling(),
            mistake_limit: default_mistake_limit(),
            timeout_secs: None,
            temperature: None,
            max_tokens: default_max_tokens(),
            stream: default_stream(),
            detector: DetectorConfig::default(),
            prose_keys: ProseToolKeys::default(),
            legacy_json: default_legacy_json(),
            force_tag_protocol: false,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_steps == 0 {
            return Err("agent.max_steps must be at least 1".to_string());
        }
        if self.mistake_limit == 0 {
            return Err("agent.mistake_limit must be at least 1".to_string());
        }
        if self.no_tool_ceiling < self.no_tool_grace {
            return Err(format!(
                "agent.no_tool_ceiling ({}) must not be below no_tool_grace ({})",
                self.no_tool_ceiling, self.no_tool_grace
            ));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("agent.temperature must be within [0, 2], got {}", t));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Prompt helpers
// ============================================================================

/// The virtual completion tool offered under the structured protocol.
pub fn completion_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: COMPLETION_TOOL.to_string(),
        description: "Signal that the task is finished. Call this only after every tool result you depend on has been seen.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                COMPLETION_RESULT_PARAM: {
                    "type": "string",
                    "description": "Final answer describing what was done"
                }
            },
            "required": [COMPLETION_RESULT_PARAM]
        }),
    }
}

/// Instructions for transports without structured tool calls.
pub fn tag_protocol_instructions(catalog: &ToolCatalog) -> String {
    let mut tools = String::new();
    for spec in catalog.specs() {
        tools.push_str(&format!("### {}\n{}\n", spec.key, spec.description));
        let required: Vec<&str> = spec
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if let Some(properties) = spec.input_schema.get("properties").and_then(Value::as_object) {
            if !properties.is_empty() {
                tools.push_str("Parameters:\n");
                for (name, schema) in properties {
                    let kind = schema.get("type").and_then(Value::as_str).unwrap_or("string");
                    let marker = if required.contains(&name.as_str()) {
                        "required"
                    } else {
                        "optional"
                    };
                    let desc = schema.get("description").and_then(Value::as_str).unwrap_or("");
                    tools.push_str(&format!("  - `{}` ({}, {}): {}\n", name, kind, marker, desc));
                }
            }
        }
        tools.push('\n');
    }

    format!(
        r#"## Tool Use

Call a tool by writing its name as an XML-style tag with one child tag per parameter:

<read_file>
<path>src/main.rs</path>
</read_file>

Rules:
- Use one state-changing tool per message. Several read-only tools may be combined.
- After a tool call, stop and wait for the result. Never invent tool results.
- File edits pass a `diff` parameter made of SEARCH/REPLACE blocks:
<<<<<<< SEARCH
exact existing lines
=======
replacement lines
>>>>>>> REPLACE
- When the task is done, answer with:
<{completion}>
<{result}>what was accomplished</{result}>
</{completion}>

## Available Tools

{tools}"#,
        completion = COMPLETION_TOOL,
        result = COMPLETION_RESULT_PARAM,
        tools = tools.trim_end()
    )
}

fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// First user turn: the sub-task plus the overall task and sibling outputs.
pub fn build_task_message(task: &str, ctx: &WorkerContext) -> String {
    let mut message = String::new();
    if !ctx.parent_task().trim().is_empty() && ctx.parent_task() != task {
        message.push_str(&format!("Overall goal:\n{}\n\n", ctx.parent_task()));
    }
    let siblings = ctx.sibling_results();
    if !siblings.is_empty() {
        let mut ids: Vec<&String> = siblings.keys().collect();
        ids.sort();
        message.push_str("Results from finished sub-tasks:\n");
        for id in ids {
            let result = &siblings[id];
            let body = if result.output.trim().is_empty() {
                result.failure_reason()
            } else {
                truncate_for_prompt(result.output.trim(), SIBLING_OUTPUT_MAX_CHARS)
            };
            message.push_str(&format!("- [{}] ({}): {}\n", id, result.status, body));
        }
        message.push('\n');
    }
    if message.is_empty() {
        return task.to_string();
    }
    message.push_str(&format!("Your task:\n{}", task));
    message
}

// ============================================================================
// Loop internals
// ============================================================================

/// How a run ended, before it becomes a `WorkerResult`.
#[derive(Debug)]
enum Exit {
    Completed { output: String, confidence: f32 },
    AcceptedFreeText(String),
    Cancelled(String),
    TimedOut,
    /// Repetition, mistake or step limit; the model is asked to summarize
    Tripped {
        termination: TerminationReason,
        reason: String,
    },
    ModelError(String),
}

enum CallError {
    Cancelled(String),
    TimedOut,
    Model(LlmError),
}

struct RunState {
    events: Arc<dyn EventSink>,
    conversation: ConversationState,
    session: GatewaySession,
    detector: RepetitionDetector,
    tokens: TokenCounts,
    steps: u32,
    tool_calls: u32,
    /// The latest model turn was cut short by a transport failure
    interrupted: bool,
}

/// One agentic loop bound to a provider, a tool set and its ports.
pub struct AgenticToolLoop {
    provider: Arc<dyn LlmProvider>,
    gateway: ToolExecutionGateway,
    parser: ResponseParser,
    structured: bool,
    tools: Vec<ToolDefinition>,
    system_prompt: Option<String>,
    events: Arc<dyn EventSink>,
    recorder: Arc<dyn InvocationRecorder>,
    compactor: Arc<dyn ContextCompactor>,
    compaction: CompactionConfig,
    retry: RetryPolicy,
    config: LoopConfig,
}

impl AgenticToolLoop {
    pub fn builder(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolProvider>,
        catalog: Arc<ToolCatalog>,
    ) -> AgenticToolLoopBuilder {
        AgenticToolLoopBuilder::new(provider, tools, catalog)
    }

    /// Whether this loop speaks the structured protocol.
    pub fn is_structured(&self) -> bool {
        self.structured
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// System prompt sent with every model call, tool instructions included.
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    fn timeout_for(&self, ctx: &WorkerContext) -> Duration {
        self.config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| ctx.worker_kind().default_timeout())
    }

    /// Run `task` for the worker in `ctx` until completion or a limit.
    pub async fn run(&self, task: &str, ctx: &WorkerContext) -> WorkerResult {
        self.run_with_events(task, ctx, self.events.clone()).await
    }

    /// Like `run`, but events go to `events` instead of the loop's own sink.
    pub async fn run_with_events(
        &self,
        task: &str,
        ctx: &WorkerContext,
        events: Arc<dyn EventSink>,
    ) -> WorkerResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = started + self.timeout_for(ctx);
        let budget = self
            .compaction
            .effective_budget(self.provider.context_window(), self.provider.supports_thinking());

        tracing::info!(
            task_id = %ctx.task_id(),
            worker_id = %ctx.worker_id(),
            kind = %ctx.worker_kind(),
            protocol = self.parser.primary_name(),
            budget,
            "worker started"
        );

        let mut run = RunState {
            conversation: ConversationState::new(build_task_message(task, ctx), budget),
            session: self.gateway.open_session(ctx).with_events(events.clone()),
            events,
            detector: RepetitionDetector::new(self.config.detector.clone()),
            tokens: TokenCounts::default(),
            steps: 0,
            tool_calls: 0,
            interrupted: false,
        };

        let exit = self.drive(&mut run, ctx, deadline).await;
        let result = self
            .conclude(&mut run, exit, ctx)
            .await
            .with_tokens(run.tokens)
            .with_model(self.provider.model())
            .with_artifacts(run.session.registry.written_paths().map(str::to_string).collect())
            .with_duration(started.elapsed());

        tracing::info!(
            worker_id = %ctx.worker_id(),
            status = %result.status,
            termination = %result.termination,
            steps = run.steps,
            "worker finished"
        );
        run.events.emit(AgentEvent::WorkerFinished {
            worker_id: ctx.worker_id().to_string(),
            status: result.status,
            termination: result.termination,
            confidence: result.confidence,
        });

        let record = InvocationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: ctx.task_id().to_string(),
            worker_id: ctx.worker_id().to_string(),
            worker_kind: ctx.worker_kind(),
            model: result.model.clone(),
            status: result.status,
            termination: result.termination,
            confidence: result.confidence,
            steps: run.steps,
            tool_calls: run.tool_calls,
            tokens: result.tokens,
            compactions: run.conversation.compactions(),
            started_at,
            finished_at: Utc::now(),
        };
        if let Err(e) = self.recorder.record(&record).await {
            tracing::warn!(worker_id = %ctx.worker_id(), error = %e, "failed to record invocation");
        }

        result
    }

    async fn drive(&self, run: &mut RunState, ctx: &WorkerContext, deadline: Instant) -> Exit {
        let worker_id = ctx.worker_id().to_string();
        loop {
            if ctx.cancellation().is_cancelled() {
                return Exit::Cancelled(ctx.cancellation().reason().unwrap_or_else(|| "cancelled".to_string()));
            }
            if Instant::now() >= deadline {
                return Exit::TimedOut;
            }
            if run.steps >= self.config.max_steps {
                return Exit::Tripped {
                    termination: TerminationReason::StepLimit,
                    reason: format!("step limit of {} reached", self.config.max_steps),
                };
            }
            run.steps += 1;
            let step = run.steps;
            run.events.emit(AgentEvent::ThinkingStarted {
                worker_id: worker_id.clone(),
                step,
            });

            if let Some(report) = compact_if_needed(
                &mut run.conversation,
                &mut run.session.registry,
                self.compactor.as_ref(),
                &self.compaction,
                self.structured,
            )
            .await
            {
                tracing::info!(
                    worker_id = %worker_id,
                    step,
                    turns_folded = report.turns_folded,
                    tokens_before = report.tokens_before,
                    tokens_after = report.tokens_after,
                    "context compacted"
                );
                run.events.emit(AgentEvent::ContextCompacted {
                    worker_id: worker_id.clone(),
                    turns_folded: report.turns_folded,
                    tokens_before: report.tokens_before,
                    tokens_after: report.tokens_after,
                    evicted_files: report.evicted_files.len(),
                });
            }

            let response = match self.call_model(run, ctx, deadline).await {
                Ok(response) => response,
                Err(CallError::Cancelled(reason)) => return Exit::Cancelled(reason),
                Err(CallError::TimedOut) => return Exit::TimedOut,
                Err(CallError::Model(e)) => {
                    tracing::error!(worker_id = %worker_id, step, error = %e, "model call failed");
                    run.events.emit(AgentEvent::Error {
                        worker_id: Some(worker_id.clone()),
                        message: e.to_string(),
                        code: Some("model_error".to_string()),
                    });
                    return Exit::ModelError(e.to_string());
                }
            };
            run.tokens
                .add(response.usage.input_tokens, response.usage.output_tokens);

            if let Some(thinking) = response.thinking.as_ref().filter(|t| !t.is_empty()) {
                run.events.emit(AgentEvent::Reasoning {
                    worker_id: worker_id.clone(),
                    content: thinking.clone(),
                });
            }
            run.conversation.push_assistant(&response);

            let parsed = self.parser.parse(&response);
            let step_calls = parsed.invocations.len();

            if let Some(exit) = self.step(run, ctx, &response, parsed).await {
                return exit;
            }

            run.events.emit(AgentEvent::StepCompleted {
                worker_id: worker_id.clone(),
                step,
                tool_calls: step_calls,
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            });
            run.events.emit(AgentEvent::ContextUsage {
                worker_id: worker_id.clone(),
                used_tokens: run.conversation.token_count(),
                budget_tokens: run.conversation.budget(),
                ratio: run.conversation.usage_ratio(),
            });
        }
    }

    /// Handle one parsed turn. Returns an exit when the loop should stop.
    async fn step(
        &self,
        run: &mut RunState,
        ctx: &WorkerContext,
        response: &LlmResponse,
        parsed: ParsedTurn,
    ) -> Option<Exit> {
        let worker_id = ctx.worker_id();

        if let Some(output) = parsed.completion.clone().filter(|_| parsed.invocations.is_empty()) {
            let confidence = match parsed.completion_origin {
                Some(InvocationOrigin::Protocol) | None => PROTOCOL_COMPLETION_CONFIDENCE,
                Some(_) => FALLBACK_COMPLETION_CONFIDENCE,
            };
            let output = if output.trim().is_empty() {
                response.text_or_empty().trim().to_string()
            } else {
                output
            };
            self.close_unanswered_calls(run, response, &[]);
            return Some(Exit::Completed { output, confidence });
        }

        if parsed.invocations.is_empty() {
            self.close_unanswered_calls(run, response, &[]);
            return self.no_tool_turn(run, ctx, response);
        }
        run.session.mistakes.reset_no_tool_use();

        if parsed.dropped > 0 {
            run.conversation.push_notice(format!(
                "Only the first tool call was executed; {} later call(s) were ignored. \
                 Use one state-changing tool per message unless every call is read-only.",
                parsed.dropped
            ));
        }

        let mut warnings = Vec::new();
        let mut stop = None;
        for call in &parsed.invocations {
            match run.detector.record(&call.tool, &call.args) {
                DetectorVerdict::Clear => {}
                DetectorVerdict::Warn { message, .. } => warnings.push(message),
                DetectorVerdict::Stop { message, .. } => {
                    stop.get_or_insert(message);
                }
            }
        }
        if let Some(reason) = stop {
            tracing::warn!(worker_id = %worker_id, reason = %reason, "repetition detected");
            run.events.emit(AgentEvent::Warning {
                worker_id: worker_id.to_string(),
                message: reason.clone(),
            });
            self.close_unanswered_calls(run, response, &[]);
            return Some(Exit::Tripped {
                termination: TerminationReason::LoopDetected,
                reason,
            });
        }

        run.tool_calls += parsed.invocations.len() as u32;
        let outcomes = self.gateway.execute_turn(&mut run.session, &parsed.invocations).await;
        for gated in &outcomes {
            let structured = self.structured && Self::is_protocol_call(&parsed.invocations, &gated.call_id);
            run.conversation.push_tool_outcome(
                &gated.call_id,
                &gated.tool,
                &gated.outcome,
                gated.file.as_deref(),
                structured,
            );
            if let Some(feedback) = &gated.feedback {
                run.conversation
                    .push_user(format!("Feedback on the rejected {} call: {}", gated.tool, feedback));
            } else if !gated.outcome.success && !gated.outcome.is_dedup {
                run.session.mistakes.record_tool_failure();
            }
        }
        self.close_unanswered_calls(run, response, &parsed.invocations);

        for message in warnings {
            run.events.emit(AgentEvent::Warning {
                worker_id: worker_id.to_string(),
                message: message.clone(),
            });
            run.conversation.push_notice(message);
        }
        if parsed.deferred_completion {
            run.conversation.push_notice(
                "Your completion signal was held back because it followed tool calls. \
                 Review the results above, then signal completion again if the task is done.",
            );
        }

        if run.session.mistakes.exceeded(self.config.mistake_limit) {
            return Some(Exit::Tripped {
                termination: TerminationReason::MistakeLimit,
                reason: format!(
                    "{} mistakes reached the limit of {}",
                    run.session.mistakes.general_errors(),
                    self.config.mistake_limit
                ),
            });
        }
        None
    }

    /// Grace, then escalate, then accept the prose as final.
    fn no_tool_turn(&self, run: &mut RunState, ctx: &WorkerContext, response: &LlmResponse) -> Option<Exit> {
        let text = response.text_or_empty().trim().to_string();
        if text.is_empty() {
            let empty = run.session.mistakes.record_no_response();
            tracing::debug!(worker_id = %ctx.worker_id(), empty, "empty model response");
        }
        let streak = run.session.mistakes.record_no_tool_use(self.config.no_tool_grace);

        if streak > self.config.no_tool_ceiling {
            if text.is_empty() {
                return Some(Exit::Tripped {
                    termination: TerminationReason::MistakeLimit,
                    reason: format!("{} consecutive turns without a tool call or an answer", streak),
                });
            }
            tracing::info!(worker_id = %ctx.worker_id(), streak, "accepting free text as final answer");
            return Some(Exit::AcceptedFreeText(text));
        }
        if run.session.mistakes.exceeded(self.config.mistake_limit) {
            return Some(Exit::Tripped {
                termination: TerminationReason::MistakeLimit,
                reason: format!(
                    "{} mistakes reached the limit of {}",
                    run.session.mistakes.general_errors(),
                    self.config.mistake_limit
                ),
            });
        }

        let notice = if streak <= self.config.no_tool_grace {
            format!(
                "No tool call was found in your response. Use a tool to make progress, \
                 or call {} with your final answer if the task is done.",
                COMPLETION_TOOL
            )
        } else {
            format!(
                "WARNING: {} responses in a row without a tool call. Your next response must \
                 either use a tool or call {}. Further plain-text responses will end the task.",
                streak, COMPLETION_TOOL
            )
        };
        run.conversation.push_notice(notice);
        None
    }

    fn is_protocol_call(calls: &[ToolInvocation], call_id: &str) -> bool {
        calls
            .iter()
            .any(|c| c.id == call_id && c.origin == InvocationOrigin::Protocol)
    }

    /// Structured transports expect a result for every tool-use block.
    /// Calls that were parsed but not executed get a short stub.
    fn close_unanswered_calls(&self, run: &mut RunState, response: &LlmResponse, executed: &[ToolInvocation]) {
        if !self.structured {
            return;
        }
        for call in &response.tool_calls {
            if call.id.is_empty() || executed.iter().any(|e| e.id == call.id) {
                continue;
            }
            let outcome = if call.name == COMPLETION_TOOL {
                ToolOutcome::rejected("Completion deferred until the other tool results were reviewed")
            } else {
                ToolOutcome::rejected("Tool call was not executed")
            };
            run.conversation
                .push_tool_outcome(&call.id, &call.name, &outcome, None, true);
        }
    }

    fn request(&self, run: &RunState, ctx: &WorkerContext) -> LlmRequest {
        let mut request = LlmRequest::new(run.conversation.messages())
            .with_max_tokens(self.config.max_tokens)
            .with_cancellation(ctx.cancellation().clone());
        if let Some(system) = &self.system_prompt {
            request = request.with_system(system.clone());
        }
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        if self.structured {
            request = request.with_tools(self.tools.clone());
        } else {
            request = request.without_tools();
        }
        request
    }

    async fn call_model(&self, run: &mut RunState, ctx: &WorkerContext, deadline: Instant) -> Result<LlmResponse, CallError> {
        let request = self.request(run, ctx);
        let provider = self.provider.as_ref();
        let retry = &self.retry;
        let stream = self.config.stream;

        let call = async move {
            if stream {
                stream_with_retry(provider, request, retry, None)
                    .await
                    .map(|streamed| (streamed.response, streamed.partial))
            } else {
                complete_with_retry(provider, request, retry)
                    .await
                    .map(|response| (response, false))
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let signal = ctx.cancellation().signal();
        let result = tokio::select! {
            biased;
            _ = signal.cancelled() => {
                return Err(CallError::Cancelled(
                    ctx.cancellation().reason().unwrap_or_else(|| "cancelled".to_string()),
                ));
            }
            result = tokio::time::timeout(remaining, call) => result,
        };

        match result {
            Err(_) => Err(CallError::TimedOut),
            Ok(Ok((response, partial))) => {
                run.interrupted = partial;
                if partial {
                    tracing::warn!(worker_id = %ctx.worker_id(), "model output was interrupted; keeping partial turn");
                }
                Ok(response)
            }
            Ok(Err(LlmError::Cancelled { reason })) => Err(CallError::Cancelled(reason)),
            Ok(Err(e)) => Err(CallError::Model(e)),
        }
    }

    /// One tools-disabled call asking for a wrap-up after a terminal trip.
    async fn final_summary(&self, run: &mut RunState, ctx: &WorkerContext, reason: &str) -> Option<String> {
        if ctx.cancellation().is_cancelled() {
            return None;
        }
        run.conversation.push_notice(format!(
            "Stopping: {}. Tools are no longer available. Summarize what was accomplished, \
             what remains unfinished, and any problems encountered.",
            reason
        ));
        let mut request = LlmRequest::new(run.conversation.messages())
            .with_max_tokens(self.config.max_tokens)
            .with_cancellation(ctx.cancellation().clone())
            .with_tool_call_mode(ToolCallMode::None)
            .without_tools();
        if let Some(system) = &self.system_prompt {
            request = request.with_system(system.clone());
        }

        let call = complete_with_retry(self.provider.as_ref(), request, &self.retry);
        match tokio::time::timeout(SUMMARY_TIMEOUT, call).await {
            Ok(Ok(response)) => {
                run.tokens
                    .add(response.usage.input_tokens, response.usage.output_tokens);
                let text = response.text_or_empty().trim().to_string();
                (!text.is_empty()).then_some(text)
            }
            Ok(Err(e)) => {
                tracing::warn!(worker_id = %ctx.worker_id(), error = %e, "final summary failed");
                None
            }
            Err(_) => {
                tracing::warn!(worker_id = %ctx.worker_id(), "final summary timed out");
                None
            }
        }
    }

    async fn conclude(&self, run: &mut RunState, exit: Exit, ctx: &WorkerContext) -> WorkerResult {
        let fallback_status = if run.session.any_success() {
            WorkerStatus::Partial
        } else {
            WorkerStatus::Failed
        };
        let fallback_confidence = if run.session.any_success() {
            PARTIAL_CONFIDENCE
        } else {
            0.0
        };
        let last_text = run.conversation.last_assistant_text().unwrap_or_default();

        match exit {
            Exit::Completed { output, confidence } => {
                let status = if run.interrupted {
                    WorkerStatus::Partial
                } else {
                    WorkerStatus::Success
                };
                WorkerResult::new(status, TerminationReason::Completed)
                    .with_output(output)
                    .with_confidence(confidence)
            }
            Exit::AcceptedFreeText(text) => {
                WorkerResult::new(WorkerStatus::Partial, TerminationReason::AcceptedFreeText)
                    .with_output(text)
                    .with_confidence(FREE_TEXT_CONFIDENCE)
            }
            Exit::Cancelled(reason) => WorkerResult::new(fallback_status, TerminationReason::Cancelled)
                .with_output(last_text)
                .with_confidence(fallback_confidence)
                .with_error(format!("cancelled: {}", reason)),
            Exit::TimedOut => {
                run.events.emit(AgentEvent::Error {
                    worker_id: Some(ctx.worker_id().to_string()),
                    message: "worker timed out".to_string(),
                    code: Some("timeout".to_string()),
                });
                WorkerResult::new(fallback_status, TerminationReason::TimedOut)
                    .with_output(last_text)
                    .with_confidence(fallback_confidence)
                    .with_error(format!(
                        "timed out after {}s",
                        self.timeout_for(ctx).as_secs()
                    ))
            }
            Exit::Tripped { termination, reason } => {
                let summary = self.final_summary(run, ctx, &reason).await;
                WorkerResult::new(fallback_status, termination)
                    .with_output(summary.unwrap_or(last_text))
                    .with_confidence(fallback_confidence)
                    .with_error(reason)
            }
            Exit::ModelError(message) => WorkerResult::new(fallback_status, TerminationReason::ModelError)
                .with_output(last_text)
                .with_confidence(fallback_confidence)
                .with_error(message),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles an `AgenticToolLoop`. Ports default to permissive no-ops.
pub struct AgenticToolLoopBuilder {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolProvider>,
    catalog: Arc<ToolCatalog>,
    policy: Arc<dyn PermissionPolicy>,
    approval: Arc<dyn ApprovalHandler>,
    events: Arc<dyn EventSink>,
    recorder: Arc<dyn InvocationRecorder>,
    compactor: Option<Arc<dyn ContextCompactor>>,
    compaction: CompactionConfig,
    gateway: GatewayConfig,
    retry: RetryPolicy,
    config: LoopConfig,
    system_prompt: Option<String>,
}

impl AgenticToolLoopBuilder {
    pub fn new(provider: Arc<dyn LlmProvider>, tools: Arc<dyn ToolProvider>, catalog: Arc<ToolCatalog>) -> Self {
        Self {
            provider,
            tools,
            catalog,
            policy: Arc::new(CapabilityPermissionPolicy::new(PermissionLevel::default())),
            approval: Arc::new(AutoApprove),
            events: Arc::new(NullEventSink),
            recorder: Arc::new(NoopRecorder),
            compactor: None,
            compaction: CompactionConfig::default(),
            gateway: GatewayConfig::default(),
            retry: RetryPolicy::default(),
            config: LoopConfig::default(),
            system_prompt: None,
        }
    }

    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PermissionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn approval(mut self, approval: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = approval;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn InvocationRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn compactor(mut self, compactor: Arc<dyn ContextCompactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    pub fn gateway(mut self, gateway: GatewayConfig) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn build(self) -> AgenticToolLoop {
        let structured = self.provider.supports_tools() && !self.config.force_tag_protocol;

        let primary: Box<dyn ToolCallProtocol> = if structured {
            Box::new(StructuredProtocol::new())
        } else {
            Box::new(TagProtocol::new(self.catalog.clone()))
        };
        let parser = ResponseParser::new(primary)
            .with_prose(ProseToolExtractor::new(self.config.prose_keys.clone(), &self.catalog))
            .with_legacy_json(self.config.legacy_json);

        let (tools, system_prompt) = if structured {
            let mut tools = self.catalog.definitions();
            tools.push(completion_tool_definition());
            (tools, self.system_prompt)
        } else {
            let instructions = tag_protocol_instructions(&self.catalog);
            let prompt = match self.system_prompt {
                Some(base) => format!("{}\n\n{}", base, instructions),
                None => instructions,
            };
            (Vec::new(), Some(prompt))
        };

        let compactor = self.compactor.unwrap_or_else(|| {
            Arc::new(
                LlmSummaryCompactor::new(self.provider.clone())
                    .with_retry(self.retry.clone())
                    .with_max_tokens(self.compaction.summary_max_tokens),
            )
        });

        let gateway = ToolExecutionGateway::new(
            self.tools,
            self.catalog,
            self.policy,
            self.approval,
            self.events.clone(),
            self.gateway,
        );

        AgenticToolLoop {
            provider: self.provider,
            gateway,
            parser,
            structured,
            tools,
            system_prompt,
            events: self.events,
            recorder: self.recorder,
            compactor,
            compaction: self.compaction,
            retry: self.retry,
            config: self.config,
        }
    }
}

/// Arguments of a structured completion call, for tests and callers that
/// build responses by hand.
pub fn completion_args(result: impl Into<String>) -> Map<String, Value> {
    let mut args = Map::new();
    args.insert(COMPLETION_RESULT_PARAM.to_string(), Value::String(result.into()));
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cascade_core::{CancellationToken, ChannelEventSink, ToolContext, WorkerKind};
    use cascade_llm::{LlmResult, ToolCall};
    use cascade_tools::{ToolKind, ToolResult, ToolSpec};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // ── Doubles ──

    struct ScriptedModel {
        replies: Mutex<VecDeque<LlmResponse>>,
        structured: bool,
        requests: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<LlmResponse>, structured: bool) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                structured,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-1"
        }

        fn supports_tools(&self) -> bool {
            self.structured
        }

        async fn complete(&self, request: LlmRequest) -> LlmResult<LlmResponse> {
            self.requests.lock().unwrap().push(request);
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| LlmResponse::text("Summary: nothing more to add.", "scripted-1")))
        }
    }

    struct FakeTools {
        calls: Mutex<Vec<String>>,
    }

    impl FakeTools {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn specs() -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("read_file", "Read a file")
                .with_kind(ToolKind::ReadFile)
                .with_path_param("path")
                .with_schema(json!({
                    "type": "object",
                    "properties": {"path": {"type": "string", "description": "File path"}},
                    "required": ["path"]
                })),
            ToolSpec::new("write_to_file", "Write a file")
                .with_kind(ToolKind::WriteFile)
                .with_path_param("path"),
            ToolSpec::new("execute_command", "Run a command").with_kind(ToolKind::Execute),
        ]
    }

    #[async_trait]
    impl ToolProvider for FakeTools {
        async fn list_tools(&self) -> Vec<ToolSpec> {
            specs()
        }

        async fn call_tool(&self, key: &str, args: &Value, _ctx: &ToolContext) -> ToolResult {
            self.calls.lock().unwrap().push(key.to_string());
            match key {
                "read_file" => ToolResult::ok(format!(
                    "contents of {}",
                    args.get("path").and_then(Value::as_str).unwrap_or("?")
                )),
                "write_to_file" => ToolResult::ok("written"),
                _ => ToolResult::ok("ok"),
            }
        }
    }

    fn text(t: &str) -> LlmResponse {
        LlmResponse::text(t, "scripted-1")
    }

    fn ctx(token: CancellationToken) -> WorkerContext {
        WorkerContext::new("task-1", WorkerKind::Coder, ".", token).with_worker_id("w1")
    }

    fn build(model: Arc<ScriptedModel>, tools: Arc<FakeTools>, config: LoopConfig) -> AgenticToolLoop {
        AgenticToolLoop::builder(model, tools, Arc::new(ToolCatalog::new(specs())))
            .config(LoopConfig {
                stream: false,
                ..config
            })
            .build()
    }

    // ── Tag protocol ──

    #[tokio::test]
    async fn test_reads_then_completes() {
        let model = ScriptedModel::new(
            vec![
                text("<read_file>\n<path>src/lib.rs</path>\n</read_file>"),
                text("<attempt_completion>\n<result>Read it.</result>\n</attempt_completion>"),
            ],
            false,
        );
        let tools = FakeTools::new();
        let agent = build(model.clone(), tools.clone(), LoopConfig::default());

        let result = agent.run("Inspect lib.rs", &ctx(CancellationToken::new())).await;

        assert_eq!(result.status, WorkerStatus::Success);
        assert_eq!(result.termination, TerminationReason::Completed);
        assert_eq!(result.output, "Read it.");
        assert!((result.confidence - PROTOCOL_COMPLETION_CONFIDENCE).abs() < f32::EPSILON);
        assert_eq!(tools.calls(), vec!["read_file"]);
        assert_eq!(model.request_count(), 2);
        assert!(agent.system_prompt().unwrap().contains("## Available Tools"));
    }

    #[tokio::test]
    async fn test_write_artifacts_reported() {
        let model = ScriptedModel::new(
            vec![
                text("<write_to_file>\n<path>out.txt</path>\n<content>hi</content>\n</write_to_file>"),
                text("<attempt_completion>\n<result>done</result>\n</attempt_completion>"),
            ],
            false,
        );
        let agent = build(model, FakeTools::new(), LoopConfig::default());
        let result = agent.run("Write", &ctx(CancellationToken::new())).await;
        assert_eq!(result.artifacts, vec!["out.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_free_text_accepted_after_ceiling() {
        let replies = (0..5).map(|i| text(&format!("thinking out loud {}", i))).collect();
        let model = ScriptedModel::new(replies, false);
        let agent = build(model.clone(), FakeTools::new(), LoopConfig::default());

        let result = agent.run("Explain", &ctx(CancellationToken::new())).await;

        assert_eq!(result.termination, TerminationReason::AcceptedFreeText);
        assert_eq!(result.status, WorkerStatus::Partial);
        assert_eq!(result.output, "thinking out loud 4");
        assert_eq!(model.request_count(), 5);
    }

    #[tokio::test]
    async fn test_repeated_call_trips_detector_and_summarizes() {
        let call = "<execute_command>\n<command>ls</command>\n</execute_command>";
        let model = ScriptedModel::new(
            vec![text(call), text(call), text(call), text("Listed the directory three times.")],
            false,
        );
        let tools = FakeTools::new();
        let agent = build(model.clone(), tools.clone(), LoopConfig::default());

        let result = agent.run("List", &ctx(CancellationToken::new())).await;

        assert_eq!(result.termination, TerminationReason::LoopDetected);
        assert_eq!(result.status, WorkerStatus::Partial);
        assert_eq!(tools.calls().len(), 2);
        assert_eq!(result.output, "Listed the directory three times.");
        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.last().unwrap().tool_call_mode, ToolCallMode::None);
    }

    #[tokio::test]
    async fn test_step_limit() {
        let replies = vec![
            text("<read_file>\n<path>a</path>\n</read_file>"),
            text("<read_file>\n<path>b</path>\n</read_file>"),
        ];
        let model = ScriptedModel::new(replies, false);
        let agent = build(
            model,
            FakeTools::new(),
            LoopConfig {
                max_steps: 2,
                ..LoopConfig::default()
            },
        );
        let result = agent.run("Read", &ctx(CancellationToken::new())).await;
        assert_eq!(result.termination, TerminationReason::StepLimit);
        assert_eq!(result.status, WorkerStatus::Partial);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel("user stop");
        let model = ScriptedModel::new(vec![], false);
        let tools = FakeTools::new();
        let agent = build(model.clone(), tools.clone(), LoopConfig::default());

        let result = agent.run("Anything", &ctx(token)).await;

        assert_eq!(result.status, WorkerStatus::Failed);
        assert!(result.is_cancelled());
        assert_eq!(model.request_count(), 0);
        assert!(tools.calls().is_empty());
    }

    #[tokio::test]
    async fn test_prose_completion_has_lower_confidence() {
        let model = ScriptedModel::new(vec![text(r#"{"done": true, "summary": "All set."}"#)], false);
        let agent = build(model, FakeTools::new(), LoopConfig::default());
        let result = agent.run("Finish", &ctx(CancellationToken::new())).await;
        assert_eq!(result.termination, TerminationReason::Completed);
        assert!((result.confidence - FALLBACK_COMPLETION_CONFIDENCE).abs() < f32::EPSILON);
    }

    // ── Structured protocol ──

    #[tokio::test]
    async fn test_structured_completion_tool() {
        let mut first = text("");
        first.tool_calls.push(ToolCall {
            id: "c1".into(),
            name: "read_file".into(),
            arguments: json!({"path": "a.rs"}),
        });
        let mut second = text("");
        second.tool_calls.push(ToolCall {
            id: "c2".into(),
            name: COMPLETION_TOOL.into(),
            arguments: Value::Object(completion_args("finished")),
        });
        let model = ScriptedModel::new(vec![first, second], true);
        let (sink, mut rx) = ChannelEventSink::channel();
        let agent = AgenticToolLoop::builder(model.clone(), FakeTools::new(), Arc::new(ToolCatalog::new(specs())))
            .config(LoopConfig {
                stream: false,
                ..LoopConfig::default()
            })
            .events(Arc::new(sink))
            .build();
        assert!(agent.is_structured());

        let result = agent.run("Read", &ctx(CancellationToken::new())).await;
        assert_eq!(result.output, "finished");
        assert_eq!(result.status, WorkerStatus::Success);

        let requests = model.requests.lock().unwrap();
        assert!(requests[0].tools.iter().any(|t| t.name == COMPLETION_TOOL));

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        assert!(kinds.contains(&"thinking_started"));
        assert!(kinds.contains(&"tool_called"));
        assert!(kinds.contains(&"step_completed"));
        assert_eq!(kinds.last(), Some(&"worker_finished"));
    }

    // ── Helpers ──

    #[test]
    fn test_task_message_includes_siblings() {
        let mut siblings = std::collections::HashMap::new();
        siblings.insert(
            "a".to_string(),
            WorkerResult::new(WorkerStatus::Success, TerminationReason::Completed).with_output("schema ready"),
        );
        let ctx = ctx(CancellationToken::new())
            .with_parent_task("Build the service")
            .with_sibling_results(Arc::new(siblings));
        let message = build_task_message("Write handlers", &ctx);
        assert!(message.contains("Overall goal:\nBuild the service"));
        assert!(message.contains("- [a] (success): schema ready"));
        assert!(message.ends_with("Your task:\nWrite handlers"));

        let plain = build_task_message("Solo", &WorkerContext::new("t", WorkerKind::Coder, ".", CancellationToken::new()));
        assert_eq!(plain, "Solo");
    }

    #[test]
    fn test_loop_config_validate() {
        assert!(LoopConfig::default().validate().is_ok());
        let bad = LoopConfig {
            no_tool_ceiling: 1,
            ..LoopConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
