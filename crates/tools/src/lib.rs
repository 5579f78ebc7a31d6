//! Cascade Agents Tools
//!
//! Tool-side building blocks for the agentic loop:
//! - `ToolProvider` / `ToolSpec` / `ToolCatalog` - the external tool port
//! - `ToolResult` / `ToolOutcome` - execution results
//! - `FileRegistry` - per-loop file content cache
//! - `protocol` - tag-embedded, structured, and legacy JSON tool-call parsing
//! - `prose` - last-resort extraction of tool intents from fenced code
//!
//! Concrete tool implementations live outside this workspace and are reached
//! through `ToolProvider`.

pub mod executor;
pub mod prose;
pub mod protocol;
pub mod trait_def;

// Re-export core types
pub use executor::{normalize_path, FileEntry, FileRegistry, ToolOutcome, ToolResult};
pub use prose::{ProseToolExtractor, ProseToolKeys};
pub use protocol::legacy::parse_legacy_json;
pub use protocol::structured::StructuredProtocol;
pub use protocol::tag::{
    parse_search_replace, EditBlock, PartialToolUse, TagBlock, TagProtocol, TagStreamParser,
};
pub use protocol::{
    InvocationOrigin, ParsedTurn, ResponseParser, ToolCallProtocol, ToolInvocation,
    COMPLETION_RESULT_PARAM, COMPLETION_TOOL,
};
pub use trait_def::{ToolCatalog, ToolKind, ToolProvider, ToolSpec};
