//! Shared test doubles: a scripted model and an in-memory tool provider.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use cascade_core::{ExecutionContext, ToolContext};
use cascade_llm::{LlmError, LlmProvider, LlmRequest, LlmResponse, LlmResult};
use cascade_tools::{ToolKind, ToolProvider, ToolResult, ToolSpec};

use cascade_agents::storage::{InvocationRecord, InvocationRecorder};
use cascade_agents::AppResult;

pub const MODEL: &str = "scripted-1";

pub fn text(t: &str) -> LlmResponse {
    LlmResponse::text(t, MODEL)
}

pub fn completion(result: &str) -> LlmResponse {
    text(&format!(
        "<attempt_completion>\n<result>{}</result>\n</attempt_completion>",
        result
    ))
}

pub fn auth_error() -> LlmError {
    LlmError::AuthenticationFailed {
        message: "invalid api key".to_string(),
    }
}

// ============================================================================
// ScriptedModel
// ============================================================================

/// Replies from a fixed queue, in order. Speaks the tag protocol.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<LlmResult<LlmResponse>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<LlmResponse>) -> Arc<Self> {
        Self::with_results(replies.into_iter().map(Ok).collect())
    }

    pub fn with_results(replies: Vec<LlmResult<LlmResponse>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<LlmRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LlmProvider for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        MODEL
    }

    fn supports_tools(&self) -> bool {
        false
    }

    async fn complete(&self, request: LlmRequest) -> LlmResult<LlmResponse> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(text("Nothing more to add.")))
    }
}

// ============================================================================
// RoutedModel
// ============================================================================

/// Picks a reply queue by the first route key found in the task section of
/// the opening user message, so concurrent workers get their own scripts.
/// Routes marked as hanging never answer until the call is cancelled.
pub struct RoutedModel {
    routes: Mutex<HashMap<String, VecDeque<LlmResult<LlmResponse>>>>,
    hanging: Vec<String>,
    log: Mutex<Vec<String>>,
}

impl RoutedModel {
    pub fn new(routes: Vec<(&str, Vec<LlmResult<LlmResponse>>)>) -> Arc<Self> {
        Self::with_hanging(routes, &[])
    }

    pub fn with_hanging(routes: Vec<(&str, Vec<LlmResult<LlmResponse>>)>, hanging: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(
                routes
                    .into_iter()
                    .map(|(key, replies)| (key.to_string(), replies.into()))
                    .collect(),
            ),
            hanging: hanging.iter().map(|h| h.to_string()).collect(),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Route keys in call order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn route_of(&self, request: &LlmRequest) -> Option<String> {
        let opening = request.messages.first()?.text_content();
        let task = opening
            .rsplit_once("Your task:\n")
            .map(|(_, task)| task.to_string())
            .unwrap_or(opening);
        let routes = self.routes.lock().unwrap();
        routes
            .keys()
            .chain(self.hanging.iter())
            .find(|key| task.contains(key.as_str()))
            .cloned()
    }
}

#[async_trait]
impl LlmProvider for RoutedModel {
    fn name(&self) -> &str {
        "routed"
    }

    fn model(&self) -> &str {
        MODEL
    }

    fn supports_tools(&self) -> bool {
        false
    }

    async fn complete(&self, request: LlmRequest) -> LlmResult<LlmResponse> {
        let Some(route) = self.route_of(&request) else {
            return Ok(completion("done"));
        };
        self.log.lock().unwrap().push(route.clone());
        if self.hanging.contains(&route) {
            std::future::pending::<()>().await;
        }
        let reply = self
            .routes
            .lock()
            .unwrap()
            .get_mut(&route)
            .and_then(|queue| queue.pop_front());
        reply.unwrap_or_else(|| Ok(completion(&format!("{} done", route))))
    }
}

// ============================================================================
// MemoryTools
// ============================================================================

/// In-memory tools. `cancel_on` fires the shared cancellation token from
/// inside the named tool.
pub struct MemoryTools {
    calls: Mutex<Vec<(String, Value)>>,
    cancel_on: Option<String>,
}

impl MemoryTools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            cancel_on: None,
        })
    }

    pub fn cancelling_on(tool: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            cancel_on: Some(tool.to_string()),
        })
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls().into_iter().map(|(name, _)| name).collect()
    }
}

pub fn specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new("read_file", "Read a file")
            .with_kind(ToolKind::ReadFile)
            .with_path_param("path")
            .with_schema(json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            })),
        ToolSpec::new("search_files", "Search files").with_kind(ToolKind::Search),
        ToolSpec::new("write_to_file", "Write a file")
            .with_kind(ToolKind::WriteFile)
            .with_path_param("path"),
        ToolSpec::new("execute_command", "Run a command").with_kind(ToolKind::Execute),
    ]
}

#[async_trait]
impl ToolProvider for MemoryTools {
    async fn list_tools(&self) -> Vec<ToolSpec> {
        specs()
    }

    async fn call_tool(&self, key: &str, args: &Value, ctx: &ToolContext) -> ToolResult {
        self.calls.lock().unwrap().push((key.to_string(), args.clone()));
        if self.cancel_on.as_deref() == Some(key) {
            ctx.cancellation().cancel("stopped by test");
        }
        match key {
            "read_file" => ToolResult::ok(format!(
                "contents of {}",
                args.get("path").and_then(Value::as_str).unwrap_or("?")
            )),
            "search_files" => ToolResult::ok("no matches"),
            "write_to_file" => ToolResult::ok("written"),
            "execute_command" => ToolResult::ok("a.rs\nb.rs"),
            other => ToolResult::err(format!("unknown tool {}", other)),
        }
    }
}

// ============================================================================
// MemoryRecorder
// ============================================================================

/// Keeps every recorded invocation in memory.
#[derive(Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<InvocationRecord>>,
}

impl MemoryRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<InvocationRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl InvocationRecorder for MemoryRecorder {
    async fn record(&self, record: &InvocationRecord) -> AppResult<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
