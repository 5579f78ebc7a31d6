//! Tool Provider Port
//!
//! Tools are implemented outside this workspace and reached through
//! `ToolProvider`. Each tool is described by a `ToolSpec` whose `kind`
//! drives permission checks, read-dedup, and the read-only parallelism rule.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cascade_core::{Capability, ToolContext};
use cascade_llm::ToolDefinition;

use crate::executor::ToolResult;

/// Coarse classification of what a tool does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ReadFile,
    Search,
    WriteFile,
    EditFile,
    Execute,
    Network,
    Delegate,
    #[default]
    Other,
}

impl ToolKind {
    pub fn is_read_only(&self) -> bool {
        matches!(self, ToolKind::ReadFile | ToolKind::Search)
    }

    /// Capability a worker needs to call a tool of this kind.
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            ToolKind::ReadFile | ToolKind::Search => Some(Capability::ReadFiles),
            ToolKind::WriteFile | ToolKind::EditFile => Some(Capability::WriteFiles),
            ToolKind::Execute => Some(Capability::Shell),
            ToolKind::Network => Some(Capability::Network),
            ToolKind::Delegate => Some(Capability::Delegate),
            ToolKind::Other => None,
        }
    }
}

/// Description of one tool as listed by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub key: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub kind: ToolKind,
    /// Name of the argument holding a file path, for path-addressed tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_param: Option<String>,
}

impl ToolSpec {
    pub fn new(key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
            kind: ToolKind::Other,
            path_param: None,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_kind(mut self, kind: ToolKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_path_param(mut self, param: impl Into<String>) -> Self {
        self.path_param = Some(param.into());
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.kind.is_read_only()
    }

    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.key.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// External tool implementation.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Tools this provider offers.
    async fn list_tools(&self) -> Vec<ToolSpec>;

    /// Execute one tool. Failures are reported in the result, not as errors.
    async fn call_tool(&self, key: &str, args: &serde_json::Value, ctx: &ToolContext)
        -> ToolResult;
}

// ============================================================================
// ToolCatalog
// ============================================================================

/// Snapshot of a provider's tool list, indexed by key.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    specs: Vec<ToolSpec>,
    by_key: HashMap<String, usize>,
}

impl ToolCatalog {
    pub fn new(specs: Vec<ToolSpec>) -> Self {
        let mut catalog = Self::default();
        for spec in specs {
            if catalog.by_key.contains_key(&spec.key) {
                tracing::warn!(tool = %spec.key, "duplicate tool key ignored");
                continue;
            }
            catalog.by_key.insert(spec.key.clone(), catalog.specs.len());
            catalog.specs.push(spec);
        }
        catalog
    }

    pub async fn from_provider(provider: &dyn ToolProvider) -> Self {
        Self::new(provider.list_tools().await)
    }

    pub fn get(&self, key: &str) -> Option<&ToolSpec> {
        self.by_key.get(key).map(|&i| &self.specs[i])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// Unknown tools are treated as mutating.
    pub fn is_read_only(&self, key: &str) -> bool {
        self.get(key).is_some_and(|s| s.is_read_only())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|s| s.key.as_str())
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.specs.iter().map(ToolSpec::to_definition).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }
}
