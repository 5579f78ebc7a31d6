//! Tool Permission Types and Classification
//!
//! Defines the permission and approval ports consulted by the gateway,
//! tool risk categories, and the default capability-based policy.
//!
//! - `PermissionPolicy` - may this worker call this tool, and does the call
//!   need human confirmation
//! - `ApprovalHandler` - asks a human; rejections may carry feedback
//! - `ChannelApprovalHandler` - routes approval requests over a channel and
//!   waits for `resolve()`, with per-tool "always allow" rules

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use uuid::Uuid;

use cascade_core::{ExecutionMode, WorkerKind};
use cascade_tools::{ToolKind, ToolSpec};

/// Permission mode. Determines which tool categories require approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    /// All write and dangerous operations require approval
    Strict,
    /// Only dangerous operations require approval (default)
    Standard,
    /// All operations auto-approved
    Permissive,
}

impl Default for PermissionLevel {
    fn default() -> Self {
        Self::Standard
    }
}

/// Risk classification for a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolRisk {
    /// Read-only operations: never require approval
    ReadOnly,
    /// File create/edit: require approval in Strict mode
    SafeWrite,
    /// Shell, delegation, unknown tools: require approval in Strict + Standard
    Dangerous,
}

impl ToolRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolRisk::ReadOnly => "ReadOnly",
            ToolRisk::SafeWrite => "SafeWrite",
            ToolRisk::Dangerous => "Dangerous",
        }
    }
}

/// Classify the risk level of a tool by its kind.
///
/// | Kind                         | Risk      |
/// |------------------------------|-----------|
/// | ReadFile, Search, Network    | ReadOnly  |
/// | WriteFile, EditFile          | SafeWrite |
/// | Execute, Delegate, Other     | Dangerous |
pub fn classify_tool_risk(kind: ToolKind) -> ToolRisk {
    match kind {
        ToolKind::ReadFile | ToolKind::Search | ToolKind::Network => ToolRisk::ReadOnly,
        ToolKind::WriteFile | ToolKind::EditFile => ToolRisk::SafeWrite,
        // Unknown tools default to Dangerous
        ToolKind::Execute | ToolKind::Delegate | ToolKind::Other => ToolRisk::Dangerous,
    }
}

/// Whether a tool of the given risk needs approval at this level.
pub fn needs_approval(risk: ToolRisk, level: PermissionLevel) -> bool {
    match level {
        PermissionLevel::Strict => matches!(risk, ToolRisk::SafeWrite | ToolRisk::Dangerous),
        PermissionLevel::Standard => matches!(risk, ToolRisk::Dangerous),
        PermissionLevel::Permissive => false,
    }
}

// ============================================================================
// Ports
// ============================================================================

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allowed,
    Denied(String),
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PermissionDecision::Allowed)
    }
}

/// Decides whether a worker may call a tool.
pub trait PermissionPolicy: Send + Sync {
    fn check_permission(
        &self,
        worker_kind: WorkerKind,
        mode: ExecutionMode,
        tool: &ToolSpec,
    ) -> PermissionDecision;

    fn requires_approval(&self, worker_kind: WorkerKind, tool: &ToolSpec, args: &Value) -> bool;
}

/// Request sent to a human approver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub worker_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub risk: ToolRisk,
}

/// Answer from a human approver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// Whether the tool execution is allowed
    pub approved: bool,
    /// If true, auto-allow this tool for the rest of the handler's lifetime
    #[serde(default)]
    pub always_allow: bool,
    /// Free text injected as a new turn when the call is rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl ApprovalResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            ..Default::default()
        }
    }

    pub fn reject(feedback: Option<String>) -> Self {
        Self {
            approved: false,
            always_allow: false,
            feedback,
        }
    }
}

#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalResponse;
}

// ============================================================================
// Default implementations
// ============================================================================

/// Capability-set checks, an optional read-only mode, and risk-based approval.
#[derive(Debug, Clone, Default)]
pub struct CapabilityPermissionPolicy {
    level: PermissionLevel,
    read_only: bool,
    denied_tools: HashSet<String>,
}

impl CapabilityPermissionPolicy {
    pub fn new(level: PermissionLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn deny_tool(mut self, key: impl Into<String>) -> Self {
        self.denied_tools.insert(key.into());
        self
    }

    pub fn level(&self) -> PermissionLevel {
        self.level
    }
}

impl PermissionPolicy for CapabilityPermissionPolicy {
    fn check_permission(
        &self,
        worker_kind: WorkerKind,
        mode: ExecutionMode,
        tool: &ToolSpec,
    ) -> PermissionDecision {
        if self.denied_tools.contains(&tool.key) {
            return PermissionDecision::Denied(format!("Tool '{}' is disabled", tool.key));
        }
        let read_only = self.read_only || mode == ExecutionMode::ReadOnly;
        if read_only && !tool.is_read_only() {
            return PermissionDecision::Denied(format!(
                "Tool '{}' modifies state and the worker is in read-only mode",
                tool.key
            ));
        }
        match tool.kind.required_capability() {
            Some(capability) if !worker_kind.has_capability(capability) => {
                PermissionDecision::Denied(format!(
                    "{} workers lack the '{}' capability required by '{}'",
                    worker_kind, capability, tool.key
                ))
            }
            _ => PermissionDecision::Allowed,
        }
    }

    fn requires_approval(&self, _worker_kind: WorkerKind, tool: &ToolSpec, _args: &Value) -> bool {
        needs_approval(classify_tool_risk(tool.kind), self.level)
    }
}

/// Approves every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    async fn request_approval(&self, _request: ApprovalRequest) -> ApprovalResponse {
        ApprovalResponse::approve()
    }
}

/// Forwards approval requests to a channel and blocks until `resolve()`.
///
/// A dropped request (closed channel, `cancel_pending`) is a rejection.
pub struct ChannelApprovalHandler {
    tx: mpsc::UnboundedSender<ApprovalRequest>,
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalResponse>>>,
    always_allowed: RwLock<HashSet<String>>,
}

impl ChannelApprovalHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Self {
            tx,
            pending: Mutex::new(HashMap::new()),
            always_allowed: RwLock::new(HashSet::new()),
        };
        (handler, rx)
    }

    /// Answer a pending request. Unknown ids are ignored.
    pub async fn resolve(&self, request_id: &str, response: ApprovalResponse) {
        let mut pending = self.pending.lock().await;
        if let Some(tx) = pending.remove(request_id) {
            let _ = tx.send(response);
        }
    }

    /// Reject every outstanding request.
    pub async fn cancel_pending(&self) {
        self.pending.lock().await.clear();
    }
}

#[async_trait]
impl ApprovalHandler for ChannelApprovalHandler {
    async fn request_approval(&self, mut request: ApprovalRequest) -> ApprovalResponse {
        if self.always_allowed.read().await.contains(&request.tool_name) {
            return ApprovalResponse::approve();
        }

        if request.request_id.is_empty() {
            request.request_id = Uuid::new_v4().to_string();
        }
        let request_id = request.request_id.clone();
        let tool_name = request.tool_name.clone();
        let (resp_tx, resp_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), resp_tx);

        if self.tx.send(request).is_err() {
            self.pending.lock().await.remove(&request_id);
            return ApprovalResponse::reject(Some("Approval channel closed".to_string()));
        }

        match resp_rx.await {
            Ok(response) => {
                if response.approved && response.always_allow {
                    self.always_allowed.write().await.insert(tool_name);
                }
                response
            }
            Err(_) => ApprovalResponse::reject(Some("Approval request was cancelled".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn spec(key: &str, kind: ToolKind) -> ToolSpec {
        ToolSpec::new(key, key).with_kind(kind)
    }

    #[test]
    fn test_classify_by_kind() {
        assert_eq!(classify_tool_risk(ToolKind::ReadFile), ToolRisk::ReadOnly);
        assert_eq!(classify_tool_risk(ToolKind::Search), ToolRisk::ReadOnly);
        assert_eq!(classify_tool_risk(ToolKind::EditFile), ToolRisk::SafeWrite);
        assert_eq!(classify_tool_risk(ToolKind::Execute), ToolRisk::Dangerous);
        assert_eq!(classify_tool_risk(ToolKind::Other), ToolRisk::Dangerous);
    }

    #[test]
    fn test_needs_approval_levels() {
        assert!(needs_approval(ToolRisk::SafeWrite, PermissionLevel::Strict));
        assert!(!needs_approval(ToolRisk::SafeWrite, PermissionLevel::Standard));
        assert!(needs_approval(ToolRisk::Dangerous, PermissionLevel::Standard));
        assert!(!needs_approval(ToolRisk::Dangerous, PermissionLevel::Permissive));
        assert!(!needs_approval(ToolRisk::ReadOnly, PermissionLevel::Strict));
    }

    #[test]
    fn test_default_permission_level_is_standard() {
        assert_eq!(PermissionLevel::default(), PermissionLevel::Standard);
    }

    #[test]
    fn test_capability_checks() {
        let policy = CapabilityPermissionPolicy::new(PermissionLevel::Standard);
        let shell = spec("execute_command", ToolKind::Execute);
        let read = spec("read_file", ToolKind::ReadFile);

        assert!(policy
            .check_permission(WorkerKind::Coder, ExecutionMode::Standard, &shell)
            .is_allowed());
        match policy.check_permission(WorkerKind::Reviewer, ExecutionMode::Standard, &shell) {
            PermissionDecision::Denied(reason) => assert!(reason.contains("shell")),
            PermissionDecision::Allowed => panic!("reviewer must not run shell commands"),
        }
        assert!(policy
            .check_permission(WorkerKind::Reviewer, ExecutionMode::Standard, &read)
            .is_allowed());
    }

    #[test]
    fn test_read_only_mode_and_denied_tools() {
        let policy = CapabilityPermissionPolicy::new(PermissionLevel::Standard).deny_tool("read_file");
        let write = spec("write_to_file", ToolKind::WriteFile);
        let read = spec("read_file", ToolKind::ReadFile);
        assert!(!policy
            .check_permission(WorkerKind::Coder, ExecutionMode::ReadOnly, &write)
            .is_allowed());
        assert!(!policy
            .check_permission(WorkerKind::Coder, ExecutionMode::Standard, &read)
            .is_allowed());
        let strict = CapabilityPermissionPolicy::new(PermissionLevel::Strict).read_only();
        assert!(!strict
            .check_permission(WorkerKind::Coder, ExecutionMode::Standard, &write)
            .is_allowed());
    }

    #[test]
    fn test_requires_approval_follows_level() {
        let write = spec("write_to_file", ToolKind::WriteFile);
        let args = serde_json::json!({});
        let strict = CapabilityPermissionPolicy::new(PermissionLevel::Strict);
        let standard = CapabilityPermissionPolicy::new(PermissionLevel::Standard);
        assert!(strict.requires_approval(WorkerKind::Coder, &write, &args));
        assert!(!standard.requires_approval(WorkerKind::Coder, &write, &args));
    }

    #[tokio::test]
    async fn test_channel_handler_resolve_and_always_allow() {
        let (handler, mut rx) = ChannelApprovalHandler::new();
        let handler = Arc::new(handler);

        let request = ApprovalRequest {
            request_id: String::new(),
            worker_id: "w".into(),
            tool_name: "execute_command".into(),
            arguments: serde_json::json!({"command": "ls"}),
            risk: ToolRisk::Dangerous,
        };

        let waiting = tokio::spawn({
            let handler = handler.clone();
            let request = request.clone();
            async move { handler.request_approval(request).await }
        });
        let sent = rx.recv().await.unwrap();
        assert!(!sent.request_id.is_empty());
        handler
            .resolve(
                &sent.request_id,
                ApprovalResponse {
                    approved: true,
                    always_allow: true,
                    feedback: None,
                },
            )
            .await;
        assert!(waiting.await.unwrap().approved);

        // Second request is auto-approved without reaching the channel.
        assert!(handler.request_approval(request).await.approved);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_handler_cancel_rejects() {
        let (handler, mut rx) = ChannelApprovalHandler::new();
        let handler = Arc::new(handler);
        let waiting = tokio::spawn({
            let handler = handler.clone();
            async move {
                handler
                    .request_approval(ApprovalRequest {
                        request_id: "r1".into(),
                        worker_id: "w".into(),
                        tool_name: "write_to_file".into(),
                        arguments: Value::Null,
                        risk: ToolRisk::SafeWrite,
                    })
                    .await
            }
        });
        rx.recv().await.unwrap();
        handler.cancel_pending().await;
        let response = waiting.await.unwrap();
        assert!(!response.approved);
        assert!(response.feedback.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_auto_approve() {
        let response = AutoApprove
            .request_approval(ApprovalRequest {
                request_id: "r".into(),
                worker_id: "w".into(),
                tool_name: "x".into(),
                arguments: Value::Null,
                risk: ToolRisk::Dangerous,
            })
            .await;
        assert!(response.approved);
    }
}
