//! Tag-Embedded Protocol
//!
//! Tool intents appear in prose as tool-named tags with child parameter tags:
//!
//! ```text
//! <read_file>
//! <path>src/lib.rs</path>
//! </read_file>
//! ```
//!
//! `TagStreamParser` consumes text incrementally, tracks open-tag depth
//! (outside, tool, parameter), and yields a block only when its closing tag
//! arrives. Unterminated or malformed tags never surface as errors; they are
//! simply absent from the result. A separate partial view exposes the block
//! currently being written for live display.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cascade_llm::LlmResponse;

use super::{ParsedTurn, ToolCallProtocol, ToolInvocation, COMPLETION_TOOL};
use crate::trait_def::ToolCatalog;

const MAX_TAG_LEN: usize = 64;

/// Parameters whose inner whitespace is significant.
const VERBATIM_PARAMS: &[&str] = &["content", "diff"];

// ============================================================================
// Incremental parser
// ============================================================================

/// A fully closed tool tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagBlock {
    pub name: String,
    pub params: Vec<(String, String)>,
}

/// The tool tag currently open, as seen so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialToolUse {
    pub name: String,
    pub params: Vec<(String, String)>,
    /// Parameter still being written and its text so far
    pub open_param: Option<(String, String)>,
}

#[derive(Debug)]
enum ParserState {
    Outside,
    InTool {
        name: String,
        params: Vec<(String, String)>,
    },
    InParam {
        name: String,
        params: Vec<(String, String)>,
        param: String,
        value_start: usize,
    },
}

enum TagScan {
    Open(String, usize),
    Close(String, usize),
    NotATag,
    Incomplete,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn clean_value(param: &str, raw: &str) -> String {
    if VERBATIM_PARAMS.contains(&param) {
        let raw = raw
            .strip_prefix("\r\n")
            .or_else(|| raw.strip_prefix('\n'))
            .unwrap_or(raw);
        let raw = raw
            .strip_suffix("\r\n")
            .or_else(|| raw.strip_suffix('\n'))
            .unwrap_or(raw);
        raw.to_string()
    } else {
        raw.trim().to_string()
    }
}

/// Incremental tag parser.
#[derive(Debug)]
pub struct TagStreamParser {
    tool_names: HashSet<String>,
    buffer: String,
    cursor: usize,
    state: ParserState,
    completed: Vec<TagBlock>,
}

impl TagStreamParser {
    pub fn new<I, S>(tool_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tool_names: tool_names.into_iter().map(Into::into).collect(),
            buffer: String::new(),
            cursor: 0,
            state: ParserState::Outside,
            completed: Vec::new(),
        }
    }

    /// Feed more text. Returns the blocks closed by this chunk.
    pub fn push(&mut self, chunk: &str) -> Vec<TagBlock> {
        self.buffer.push_str(chunk);
        let before = self.completed.len();
        while self.step() {}
        self.completed[before..].to_vec()
    }

    /// 0 outside any tag, 1 inside a tool tag, 2 inside a parameter tag.
    pub fn depth(&self) -> usize {
        match self.state {
            ParserState::Outside => 0,
            ParserState::InTool { .. } => 1,
            ParserState::InParam { .. } => 2,
        }
    }

    /// The open tool tag, if any. Display only.
    pub fn partial(&self) -> Option<PartialToolUse> {
        match &self.state {
            ParserState::Outside => None,
            ParserState::InTool { name, params } => Some(PartialToolUse {
                name: name.clone(),
                params: params.clone(),
                open_param: None,
            }),
            ParserState::InParam {
                name,
                params,
                param,
                value_start,
            } => Some(PartialToolUse {
                name: name.clone(),
                params: params.clone(),
                open_param: Some((param.clone(), self.buffer[*value_start..].to_string())),
            }),
        }
    }

    /// All closed blocks. Anything still open is discarded.
    pub fn finish(self) -> Vec<TagBlock> {
        if let Some(partial) = self.partial() {
            tracing::debug!(tool = %partial.name, "discarding unterminated tool tag");
        }
        self.completed
    }

    fn scan_tag(&self, open: usize) -> TagScan {
        let rest = &self.buffer[open + 1..];
        for (i, ch) in rest.char_indices() {
            if ch == '>' {
                let inner = &rest[..i];
                let end = open + 1 + i + 1;
                return match inner.strip_prefix('/') {
                    Some(name) if is_identifier(name) => TagScan::Close(name.to_string(), end),
                    Some(_) => TagScan::NotATag,
                    None if is_identifier(inner) => TagScan::Open(inner.to_string(), end),
                    None => TagScan::NotATag,
                };
            }
            let allowed = ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || (ch == '/' && i == 0);
            if i >= MAX_TAG_LEN || !allowed {
                return TagScan::NotATag;
            }
        }
        TagScan::Incomplete
    }

    fn next_open_bracket(&self) -> Option<usize> {
        self.buffer[self.cursor..].find('<').map(|rel| self.cursor + rel)
    }

    /// Advance the state machine once. Returns false when more input is needed.
    fn step(&mut self) -> bool {
        let state = std::mem::replace(&mut self.state, ParserState::Outside);
        let (next, progressed) = match state {
            ParserState::Outside => match self.next_open_bracket() {
                None => {
                    self.cursor = self.buffer.len();
                    (ParserState::Outside, false)
                }
                Some(open) => match self.scan_tag(open) {
                    TagScan::Incomplete => {
                        self.cursor = open;
                        (ParserState::Outside, false)
                    }
                    TagScan::Open(name, end) if self.tool_names.contains(&name) => {
                        self.cursor = end;
                        (
                            ParserState::InTool {
                                name,
                                params: Vec::new(),
                            },
                            true,
                        )
                    }
                    _ => {
                        self.cursor = open + 1;
                        (ParserState::Outside, true)
                    }
                },
            },
            ParserState::InTool { name, params } => match self.next_open_bracket() {
                None => {
                    self.cursor = self.buffer.len();
                    (ParserState::InTool { name, params }, false)
                }
                Some(open) => match self.scan_tag(open) {
                    TagScan::Incomplete => {
                        self.cursor = open;
                        (ParserState::InTool { name, params }, false)
                    }
                    TagScan::Close(closing, end) if closing == name => {
                        self.cursor = end;
                        self.completed.push(TagBlock { name, params });
                        (ParserState::Outside, true)
                    }
                    TagScan::Open(param, end) => {
                        self.cursor = end;
                        (
                            ParserState::InParam {
                                name,
                                params,
                                param,
                                value_start: end,
                            },
                            true,
                        )
                    }
                    _ => {
                        self.cursor = open + 1;
                        (ParserState::InTool { name, params }, true)
                    }
                },
            },
            ParserState::InParam {
                name,
                mut params,
                param,
                value_start,
            } => {
                let param_close = format!("</{}>", param);
                let tool_close = format!("</{}>", name);
                let haystack = &self.buffer[value_start..];
                let param_end = haystack.find(&param_close);
                let tool_end = haystack.find(&tool_close);
                match (param_end, tool_end) {
                    (Some(p), t) if t.map_or(true, |t| p < t) => {
                        let value = clean_value(&param, &haystack[..p]);
                        self.cursor = value_start + p + param_close.len();
                        params.retain(|(k, _)| k != &param);
                        params.push((param, value));
                        (ParserState::InTool { name, params }, true)
                    }
                    (_, Some(t)) => {
                        tracing::debug!(tool = %name, param = %param, "parameter closed by tool tag; dropping malformed call");
                        self.cursor = value_start + t + tool_close.len();
                        (ParserState::Outside, true)
                    }
                    (None, None) => (
                        ParserState::InParam {
                            name,
                            params,
                            param,
                            value_start,
                        },
                        false,
                    ),
                    // Covered by the first arm: its guard is always true when `t` is `None`.
                    (Some(_), None) => unreachable!(),
                }
            }
        };
        self.state = next;
        progressed
    }
}

// ============================================================================
// Search/replace edit blocks
// ============================================================================

/// One search/replace edit parsed from a `diff` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditBlock {
    pub search: String,
    pub replace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
}

/// Parse every complete search/replace block:
///
/// ```text
/// <<<<<<< SEARCH
/// :start_line:12
/// -------
/// old text
/// =======
/// new text
/// >>>>>>> REPLACE
/// ```
///
/// The `:start_line:` and `-------` header lines are optional. Unterminated
/// blocks are ignored.
pub fn parse_search_replace(diff: &str) -> Vec<EditBlock> {
    enum Section {
        Idle,
        Search {
            start_line: Option<usize>,
            lines: Vec<String>,
        },
        Replace {
            start_line: Option<usize>,
            search: String,
            lines: Vec<String>,
        },
    }

    let mut blocks = Vec::new();
    let mut section = Section::Idle;
    for line in diff.lines() {
        let marker = line.trim();
        section = match section {
            Section::Idle => {
                if marker.starts_with("<<<<<<<") && marker.contains("SEARCH") {
                    Section::Search {
                        start_line: None,
                        lines: Vec::new(),
                    }
                } else {
                    Section::Idle
                }
            }
            Section::Search {
                mut start_line,
                mut lines,
            } => {
                if lines.is_empty() && marker.starts_with(":start_line:") {
                    start_line = marker[":start_line:".len()..].trim().parse().ok();
                    Section::Search { start_line, lines }
                } else if lines.is_empty() && marker == "-------" {
                    Section::Search { start_line, lines }
                } else if marker == "=======" {
                    Section::Replace {
                        start_line,
                        search: lines.join("\n"),
                        lines: Vec::new(),
                    }
                } else {
                    lines.push(line.to_string());
                    Section::Search { start_line, lines }
                }
            }
            Section::Replace {
                start_line,
                search,
                mut lines,
            } => {
                if marker.starts_with(">>>>>>>") {
                    blocks.push(EditBlock {
                        search,
                        replace: lines.join("\n"),
                        start_line,
                    });
                    Section::Idle
                } else {
                    lines.push(line.to_string());
                    Section::Replace {
                        start_line,
                        search,
                        lines,
                    }
                }
            }
        };
    }
    blocks
}

// ============================================================================
// Protocol
// ============================================================================

/// Tag-embedded protocol bound to a tool catalog.
pub struct TagProtocol {
    catalog: Arc<ToolCatalog>,
}

impl TagProtocol {
    pub fn new(catalog: Arc<ToolCatalog>) -> Self {
        Self { catalog }
    }

    /// A fresh incremental parser recognizing the catalog's tools and the
    /// completion tag.
    pub fn stream_parser(&self) -> TagStreamParser {
        TagStreamParser::new(
            self.catalog
                .keys()
                .map(str::to_string)
                .chain(std::iter::once(COMPLETION_TOOL.to_string())),
        )
    }

    fn to_invocation(block: TagBlock) -> ToolInvocation {
        let mut args = Map::new();
        for (key, value) in block.params {
            if key == "diff" {
                let edits = parse_search_replace(&value);
                if !edits.is_empty() {
                    args.insert(
                        "edits".to_string(),
                        serde_json::to_value(&edits).unwrap_or(Value::Null),
                    );
                }
            }
            args.insert(key, Value::String(value));
        }
        ToolInvocation::new(block.name, args)
    }
}

impl ToolCallProtocol for TagProtocol {
    fn name(&self) -> &'static str {
        "tag"
    }

    fn parse(&self, response: &LlmResponse) -> ParsedTurn {
        let mut parser = self.stream_parser();
        parser.push(response.text_or_empty());
        let calls = parser
            .finish()
            .into_iter()
            .map(Self::to_invocation)
            .collect();

        let mut turn = ParsedTurn::from_ordered(calls);
        let all_read_only = turn
            .invocations
            .iter()
            .all(|c| self.catalog.is_read_only(&c.tool));
        if turn.invocations.len() >= 2 && !all_read_only {
            turn.dropped = turn.invocations.len() - 1;
            turn.invocations.truncate(1);
        }
        turn
    }
}
