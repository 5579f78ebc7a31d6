//! Tool Execution Gateway
//!
//! Every tool call a worker makes passes through here, in order:
//!
//! 1. Permission check against the worker's kind and mode
//! 2. Ignore-list check for path-addressed tools (gitignore syntax)
//! 3. Read-dedup against the invocation's file registry
//! 4. Human approval for calls the policy flags
//! 5. Timed dispatch to the tool provider
//! 6. Registry refresh and per-file edit failure guidance
//! 7. A `ToolCalled` event
//!
//! Denials and failures are returned as outcomes, never as errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::{Deserialize, Serialize};

use cascade_core::{AgentEvent, EventSink, ExecutionContext, WorkerContext};
use cascade_tools::{
    FileRegistry, ToolCatalog, ToolInvocation, ToolKind, ToolOutcome, ToolProvider, ToolSpec,
};

use super::loop_detector::MistakeCounters;
use super::permissions::{
    classify_tool_risk, ApprovalHandler, ApprovalRequest, PermissionDecision, PermissionPolicy,
};

/// Argument carrying the full content of a file write.
pub const WRITE_CONTENT_PARAM: &str = "content";
/// Optional first line (1-based) of a ranged read.
pub const START_LINE_PARAM: &str = "start_line";
/// Optional last line (inclusive) of a ranged read.
pub const END_LINE_PARAM: &str = "end_line";

fn default_ignore_file() -> String {
    ".cascadeignore".to_string()
}

fn default_dedup_reads() -> bool {
    true
}

fn default_max_output_chars() -> usize {
    50_000
}

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Inline gitignore-style patterns
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    /// Ignore file resolved against the working directory
    #[serde(default = "default_ignore_file")]
    pub ignore_file: String,
    /// Per-call timeout. `None` waits indefinitely.
    #[serde(default)]
    pub tool_timeout_secs: Option<u64>,
    #[serde(default = "default_dedup_reads")]
    pub dedup_reads: bool,
    /// Tool output beyond this is truncated before reaching the model
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            ignore_file: default_ignore_file(),
            tool_timeout_secs: None,
            dedup_reads: default_dedup_reads(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

// ============================================================================
// IgnoreList
// ============================================================================

/// Gitignore-syntax matcher rooted at the working directory.
#[derive(Debug, Clone)]
pub struct IgnoreList {
    root: PathBuf,
    matcher: Gitignore,
}

impl IgnoreList {
    /// Combine the ignore file under `root` (if present) with inline patterns.
    /// Returns an empty matcher if building fails.
    pub fn load(root: &Path, config: &GatewayConfig) -> Self {
        let mut builder = GitignoreBuilder::new(root);
        let file = root.join(&config.ignore_file);
        if file.is_file() {
            if let Some(err) = builder.add(&file) {
                tracing::warn!(path = %file.display(), error = %err, "failed to read ignore file");
            }
        }
        for pattern in &config.ignore_patterns {
            if let Err(err) = builder.add_line(None, pattern) {
                tracing::warn!(pattern = %pattern, error = %err, "invalid ignore pattern");
            }
        }
        let matcher = builder.build().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to build ignore matcher");
            Gitignore::empty()
        });
        Self {
            root: root.to_path_buf(),
            matcher,
        }
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        if self.matcher.is_empty() {
            return false;
        }
        let candidate = Path::new(path);
        let rel = if candidate.is_absolute() {
            match candidate.strip_prefix(&self.root) {
                Ok(rel) => rel,
                Err(_) => return false,
            }
        } else {
            candidate
        };
        self.matcher.matched_path_or_any_parents(rel, false).is_ignore()
    }
}

// ============================================================================
// Session + outcomes
// ============================================================================

/// Per-invocation gateway state. Never shared across workers.
pub struct GatewaySession {
    pub ctx: WorkerContext,
    pub registry: FileRegistry,
    pub mistakes: MistakeCounters,
    ignore: IgnoreList,
    events: Arc<dyn EventSink>,
    successes: u32,
}

impl GatewaySession {
    /// Route this session's `ToolCalled` events to `events` instead of the
    /// gateway's default sink.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Whether any tool call in this invocation has succeeded.
    pub fn any_success(&self) -> bool {
        self.successes > 0
    }

    pub fn successes(&self) -> u32 {
        self.successes
    }
}

/// One gated call, ready to be appended to the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct GatedOutcome {
    pub call_id: String,
    pub tool: String,
    pub outcome: ToolOutcome,
    /// Normalized path for path-addressed tools
    pub file: Option<String>,
    /// Free text from a rejected approval, injected as its own turn
    pub feedback: Option<String>,
    /// Stopped before reaching the provider (permission, ignore, approval)
    pub rejected: bool,
}

enum Prepared<'c> {
    Done(GatedOutcome),
    Dispatch {
        call: &'c ToolInvocation,
        spec: ToolSpec,
        path: Option<String>,
        ranged: bool,
    },
}

struct Dispatched {
    outcome: ToolOutcome,
    feedback: Option<String>,
    rejected: bool,
}

fn truncate_chars(text: &mut String, max_chars: usize) {
    if let Some((idx, _)) = text.char_indices().nth(max_chars) {
        let omitted = text[idx..].chars().count();
        text.truncate(idx);
        text.push_str(&format!("\n[... {} characters truncated]", omitted));
    }
}

/// Escalating guidance after the `failures`-th failed edit of one file.
fn edit_guidance(path: &str, failures: u32, cached: Option<&str>) -> String {
    match failures {
        0 | 1 => match cached {
            Some(content) => format!(
                "The edit to {} failed. Current content of the file:\n{}\nRetry with fewer, smaller edit blocks.",
                path, content
            ),
            None => format!(
                "The edit to {} failed. Read the file again and retry with fewer, smaller edit blocks.",
                path
            ),
        },
        2 | 3 => format!(
            "The edit to {} failed again. The SEARCH text must match the file exactly, \
             character for character, including whitespace and indentation. Copy it verbatim from the latest file content.",
            path
        ),
        _ => format!(
            "Editing {} has failed {} times. Stop using diffs for this file and rewrite the complete file with write_to_file.",
            path, failures
        ),
    }
}

// ============================================================================
// Gateway
// ============================================================================

pub struct ToolExecutionGateway {
    provider: Arc<dyn ToolProvider>,
    catalog: Arc<ToolCatalog>,
    policy: Arc<dyn PermissionPolicy>,
    approval: Arc<dyn ApprovalHandler>,
    events: Arc<dyn EventSink>,
    config: GatewayConfig,
}

impl ToolExecutionGateway {
    pub fn new(
        provider: Arc<dyn ToolProvider>,
        catalog: Arc<ToolCatalog>,
        policy: Arc<dyn PermissionPolicy>,
        approval: Arc<dyn ApprovalHandler>,
        events: Arc<dyn EventSink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider,
            catalog,
            policy,
            approval,
            events,
            config,
        }
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    /// Fresh state for one worker invocation.
    pub fn open_session(&self, ctx: &WorkerContext) -> GatewaySession {
        GatewaySession {
            ignore: IgnoreList::load(ctx.working_dir(), &self.config),
            ctx: ctx.clone(),
            registry: FileRegistry::new(),
            mistakes: MistakeCounters::new(),
            events: self.events.clone(),
            successes: 0,
        }
    }

    /// Run one turn's calls. An all-read-only batch runs concurrently;
    /// anything else runs sequentially in document order. Outcomes keep the
    /// order of `calls`.
    pub async fn execute_turn(
        &self,
        session: &mut GatewaySession,
        calls: &[ToolInvocation],
    ) -> Vec<GatedOutcome> {
        let concurrent = calls.len() > 1 && calls.iter().all(|c| self.catalog.is_read_only(&c.tool));
        if !concurrent {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                outcomes.push(self.execute(session, call).await);
            }
            return outcomes;
        }

        let prepared: Vec<Prepared<'_>> = calls.iter().map(|c| self.prepare(session, c)).collect();
        let dispatched = {
            let ctx = &session.ctx;
            join_all(prepared.iter().map(|p| async move {
                match p {
                    Prepared::Dispatch { call, spec, .. } => Some(self.approve_and_dispatch(ctx, call, spec).await),
                    Prepared::Done(_) => None,
                }
            }))
            .await
        };

        prepared
            .into_iter()
            .zip(dispatched)
            .map(|(p, d)| match (p, d) {
                (Prepared::Dispatch { call, spec, path, ranged }, Some(d)) => {
                    self.finish(session, call, &spec, path, ranged, d)
                }
                (Prepared::Done(outcome), _) => self.record(session, outcome),
                (Prepared::Dispatch { call, .. }, None) => self.record(
                    session,
                    GatedOutcome {
                        call_id: call.id.clone(),
                        tool: call.tool.clone(),
                        outcome: ToolOutcome::rejected("Tool call was not dispatched"),
                        file: None,
                        feedback: None,
                        rejected: true,
                    },
                ),
            })
            .collect()
    }

    /// Run a single call through every gate.
    pub async fn execute(&self, session: &mut GatewaySession, call: &ToolInvocation) -> GatedOutcome {
        match self.prepare(session, call) {
            Prepared::Done(outcome) => self.record(session, outcome),
            Prepared::Dispatch {
                call,
                spec,
                path,
                ranged,
            } => {
                let dispatched = self.approve_and_dispatch(&session.ctx, call, &spec).await;
                self.finish(session, call, &spec, path, ranged, dispatched)
            }
        }
    }

    fn reject(call: &ToolInvocation, message: String, path: Option<String>) -> Prepared<'_> {
        Prepared::Done(GatedOutcome {
            call_id: call.id.clone(),
            tool: call.tool.clone(),
            outcome: ToolOutcome::rejected(message),
            file: path,
            feedback: None,
            rejected: true,
        })
    }

    /// Synchronous gates: lookup, permission, ignore list, read-dedup.
    fn prepare<'c>(&self, session: &mut GatewaySession, call: &'c ToolInvocation) -> Prepared<'c> {
        let spec = match self.catalog.get(&call.tool) {
            Some(spec) => spec.clone(),
            None => {
                let available: Vec<&str> = self.catalog.keys().collect();
                return Self::reject(
                    call,
                    format!("Unknown tool '{}'. Available tools: {}", call.tool, available.join(", ")),
                    None,
                );
            }
        };

        if let PermissionDecision::Denied(reason) =
            self.policy
                .check_permission(session.ctx.worker_kind(), session.ctx.mode(), &spec)
        {
            tracing::debug!(tool = %call.tool, reason = %reason, "tool call denied");
            return Self::reject(call, format!("Permission denied: {}", reason), None);
        }

        let path = spec
            .path_param
            .as_deref()
            .and_then(|param| call.arg_str(param))
            .map(cascade_tools::normalize_path);

        if let Some(path) = &path {
            if session.ignore.is_ignored(path) {
                return Self::reject(
                    call,
                    format!("Access to '{}' is blocked by the ignore list", path),
                    Some(path.clone()),
                );
            }
        }

        let start = call.arg_usize(START_LINE_PARAM);
        let end = call.arg_usize(END_LINE_PARAM);
        let ranged = start.is_some() || end.is_some();

        if self.config.dedup_reads && spec.kind == ToolKind::ReadFile {
            if let Some(path) = &path {
                if let Some(content) = session.registry.serve(path, start, end) {
                    tracing::debug!(tool = %call.tool, path = %path, "serving read from file registry");
                    return Prepared::Done(GatedOutcome {
                        call_id: call.id.clone(),
                        tool: call.tool.clone(),
                        outcome: ToolOutcome::dedup(format!(
                            "[{} unchanged since it was last read in this task]\n{}",
                            path, content
                        )),
                        file: Some(path.clone()),
                        feedback: None,
                        rejected: false,
                    });
                }
            }
        }

        Prepared::Dispatch {
            call,
            spec,
            path,
            ranged,
        }
    }

    /// Approval gate plus the timed provider call.
    async fn approve_and_dispatch(
        &self,
        ctx: &WorkerContext,
        call: &ToolInvocation,
        spec: &ToolSpec,
    ) -> Dispatched {
        let args = call.args_value();

        if self.policy.requires_approval(ctx.worker_kind(), spec, &args) {
            let response = self
                .approval
                .request_approval(ApprovalRequest {
                    request_id: String::new(),
                    worker_id: ctx.worker_id().to_string(),
                    tool_name: call.tool.clone(),
                    arguments: args.clone(),
                    risk: classify_tool_risk(spec.kind),
                })
                .await;
            if !response.approved {
                let mut message = format!("The user rejected the {} operation.", call.tool);
                if let Some(feedback) = response.feedback.as_deref().filter(|f| !f.trim().is_empty()) {
                    message.push_str(&format!(" Feedback: {}", feedback.trim()));
                }
                return Dispatched {
                    outcome: ToolOutcome::rejected(message),
                    feedback: response.feedback.filter(|f| !f.trim().is_empty()),
                    rejected: true,
                };
            }
        }

        if ctx.cancellation().is_cancelled() {
            return Dispatched {
                outcome: ToolOutcome::rejected("Tool call cancelled"),
                feedback: None,
                rejected: true,
            };
        }

        let tool_ctx = ctx.tool_context(call.id.clone());
        let started = Instant::now();
        let call_future = self.provider.call_tool(&call.tool, &args, &tool_ctx);
        let timed = async {
            match self.config.tool_timeout_secs {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), call_future)
                    .await
                    .map_err(|_| secs),
                None => Ok(call_future.await),
            }
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => {
                return Dispatched {
                    outcome: ToolOutcome::rejected("Tool call cancelled"),
                    feedback: None,
                    rejected: true,
                };
            }
            result = timed => result,
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        let mut outcome = match result {
            Ok(result) => ToolOutcome::from_result(&result, latency_ms),
            Err(secs) => {
                tracing::warn!(tool = %call.tool, timeout_secs = secs, "tool call timed out");
                ToolOutcome {
                    success: false,
                    content: format!("Error: {} timed out after {}s", call.tool, secs),
                    latency_ms,
                    is_dedup: false,
                }
            }
        };
        truncate_chars(&mut outcome.content, self.config.max_output_chars);

        Dispatched {
            outcome,
            feedback: None,
            rejected: false,
        }
    }

    /// Post-execution bookkeeping for a dispatched call.
    fn finish(
        &self,
        session: &mut GatewaySession,
        call: &ToolInvocation,
        spec: &ToolSpec,
        path: Option<String>,
        ranged: bool,
        dispatched: Dispatched,
    ) -> GatedOutcome {
        let Dispatched {
            mut outcome,
            feedback,
            rejected,
        } = dispatched;

        if !rejected {
            if let Some(path) = &path {
                match (spec.kind, outcome.success) {
                    (ToolKind::ReadFile, true) if !ranged => {
                        session.registry.record_read(path, outcome.content.clone());
                    }
                    (ToolKind::WriteFile, true) => {
                        session.registry.record_write(path, call.arg_str(WRITE_CONTENT_PARAM));
                        session.mistakes.reset_edit_failures(path);
                    }
                    (ToolKind::EditFile, true) => {
                        session.registry.record_write(path, None);
                        session.mistakes.reset_edit_failures(path);
                    }
                    (ToolKind::EditFile, false) => {
                        let failures = session.mistakes.record_edit_failure(path);
                        let cached = session.registry.get(path).map(|e| e.content.as_str());
                        outcome.content.push_str("\n\n");
                        outcome.content.push_str(&edit_guidance(path, failures, cached));
                    }
                    _ => {}
                }
            }
        }

        self.record(
            session,
            GatedOutcome {
                call_id: call.id.clone(),
                tool: call.tool.clone(),
                outcome,
                file: path,
                feedback,
                rejected,
            },
        )
    }

    fn record(&self, session: &mut GatewaySession, gated: GatedOutcome) -> GatedOutcome {
        if gated.outcome.success {
            session.successes += 1;
        }
        tracing::debug!(
            worker_id = %session.ctx.worker_id(),
            tool = %gated.tool,
            success = gated.outcome.success,
            duration_ms = gated.outcome.latency_ms,
            "tool call finished"
        );
        session.events.emit(AgentEvent::ToolCalled {
            worker_id: session.ctx.worker_id().to_string(),
            tool: gated.tool.clone(),
            success: gated.outcome.success,
            duration_ms: gated.outcome.latency_ms,
            summary: gated.outcome.summary(),
            deduplicated: gated.outcome.is_dedup,
        });
        gated
    }
}
