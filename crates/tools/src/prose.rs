//! Prose Tool Extraction
//!
//! Last-resort fallback for models that ignore the tool protocol and answer
//! with fenced code instead. Shell-like fences become shell calls (one per
//! logical line); fences with a recognizable file path become write calls.
//! Every synthetic call carries a confidence score so callers can tell a
//! tagged `bash` fence from a guessed one.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::{InvocationOrigin, ParsedTurn, ToolInvocation};
use crate::trait_def::ToolCatalog;

const SHELL_LANGS: &[&str] = &[
    "bash",
    "sh",
    "shell",
    "zsh",
    "console",
    "terminal",
    "cmd",
    "powershell",
    "ps1",
];

const TAGGED_SHELL_CONFIDENCE: f32 = 0.8;
const PREFIX_SHELL_CONFIDENCE: f32 = 0.6;
const IN_BLOCK_PATH_CONFIDENCE: f32 = 0.75;

/// How many prose lines above a fence are searched for a path.
const PATH_LOOKBACK_LINES: usize = 5;

/// Tool keys and parameter names used for synthetic calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProseToolKeys {
    pub shell_tool: String,
    pub shell_command_param: String,
    pub write_tool: String,
    pub write_path_param: String,
    pub write_content_param: String,
}

impl Default for ProseToolKeys {
    fn default() -> Self {
        Self {
            shell_tool: "execute_command".to_string(),
            shell_command_param: "command".to_string(),
            write_tool: "write_to_file".to_string(),
            write_path_param: "path".to_string(),
            write_content_param: "content".to_string(),
        }
    }
}

struct ProsePatterns {
    command_prefix: Option<Regex>,
    path_comment: Option<Regex>,
    /// Ordered prose path patterns with their confidence
    prose_paths: Vec<(Regex, f32)>,
    completion: Option<Regex>,
}

fn patterns() -> &'static ProsePatterns {
    static PATTERNS: OnceLock<ProsePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ProsePatterns {
        command_prefix: Regex::new(
            r"^(?:\$ )?(?:cargo|rustc|rustup|npm|npx|yarn|pnpm|bun|deno|node|pip3?|python3?|pytest|uv|poetry|go|git|make|cmake|cd|ls|mkdir|rm|cp|mv|cat|echo|touch|chmod|grep|find|curl|wget|docker|kubectl|sudo|apt|apt-get|brew)(?:\s|$)",
        )
        .ok(),
        path_comment: Regex::new(
            r"^\s*(?://|#|--|;|/\*|<!--)\s*(?:(?i:file(?:name)?|path)\s*:\s*)?((?:[\w.-]+/)*[\w.-]+\.[A-Za-z0-9]{1,10})\s*(?:\*/|-->)?\s*$",
        )
        .ok(),
        prose_paths: [
            (r"`((?:[\w.-]+/)*[\w.-]+\.[A-Za-z0-9]{1,10})`", 0.65),
            (
                r"(?i)\b(?:file|filename|path)\s*:\s*\**((?:[\w.-]+/)*[\w.-]+\.[A-Za-z0-9]{1,10})",
                0.65,
            ),
            (r"\*\*((?:[\w.-]+/)*[\w.-]+\.[A-Za-z0-9]{1,10})\*\*", 0.6),
            (
                r"(?:^|\s)((?:[\w.-]+/)*[\w-]+\.[A-Za-z][A-Za-z0-9]{0,9})(?:[\s:,;)]|\.?$)",
                0.5,
            ),
        ]
        .into_iter()
        .filter_map(|(raw, confidence)| Regex::new(raw).ok().map(|r| (r, confidence)))
        .collect(),
        completion: Regex::new(
            r"(?im)^\s*(?:the task is (?:now )?(?:complete|completed|done|finished)|task (?:complete|completed|done)|i(?:'ve| have) (?:completed|finished) (?:the|this|all)|all (?:tasks|changes|steps) (?:are|have been) (?:complete|completed|done|made)|(?:the )?(?:implementation|work) is (?:now )?(?:complete|done|finished))\b",
        )
        .ok(),
    })
}

/// Rejects tokens like `e.g` that the bare pattern would otherwise accept.
fn looks_like_path(candidate: &str) -> bool {
    if candidate.contains('/') {
        return true;
    }
    candidate
        .split('.')
        .next()
        .is_some_and(|stem| stem.chars().count() >= 2)
}

#[derive(Debug)]
struct Fence<'a> {
    lang: String,
    body: Vec<&'a str>,
    /// Non-empty prose lines between the previous fence and this one
    prose: Vec<&'a str>,
}

/// Closed fences in document order. An unclosed fence is ignored.
fn fences(text: &str) -> Vec<Fence<'_>> {
    let mut result = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut open: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        match open.take() {
            None => match trimmed.strip_prefix("```") {
                Some(info) => {
                    let lang = info
                        .split_whitespace()
                        .next()
                        .unwrap_or("")
                        .to_ascii_lowercase();
                    open = Some((lang, Vec::new()));
                }
                None => {
                    if !line.trim().is_empty() {
                        prose.push(line);
                    }
                }
            },
            Some((lang, mut body)) => {
                if trimmed.trim_end() == "```" {
                    result.push(Fence {
                        lang,
                        body,
                        prose: std::mem::take(&mut prose),
                    });
                } else {
                    body.push(line);
                    open = Some((lang, body));
                }
            }
        }
    }
    result
}

/// Logical shell commands: continuations joined, prompts stripped, comments
/// and blank lines skipped.
fn shell_commands(body: &[&str]) -> Vec<String> {
    let mut commands = Vec::new();
    let mut pending = String::new();
    for line in body {
        let mut line = line.trim();
        if pending.is_empty() {
            if let Some(rest) = line.strip_prefix("$ ") {
                line = rest.trim_start();
            } else if line == "$" {
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
        }
        match line.strip_suffix('\\') {
            Some(head) => {
                pending.push_str(head.trim_end());
                pending.push(' ');
            }
            None => {
                pending.push_str(line);
                let command = std::mem::take(&mut pending).trim().to_string();
                if !command.is_empty() {
                    commands.push(command);
                }
            }
        }
    }
    let tail = pending.trim();
    if !tail.is_empty() {
        commands.push(tail.to_string());
    }
    commands
}

fn first_meaningful_line<'a>(body: &[&'a str]) -> Option<&'a str> {
    body.iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && !l.starts_with('#'))
}

/// Path from a leading comment inside the block. Returns the path and the
/// index of the comment line.
fn in_block_path(body: &[&str]) -> Option<(String, usize)> {
    let regex = patterns().path_comment.as_ref()?;
    let (index, line) = body
        .iter()
        .enumerate()
        .find(|(_, l)| !l.trim().is_empty())?;
    let captures = regex.captures(line)?;
    let path = captures.get(1)?.as_str();
    looks_like_path(path).then(|| (path.to_string(), index))
}

/// Path from the prose above the block, nearest line first, patterns in order.
fn prose_path(prose: &[&str]) -> Option<(String, f32)> {
    let start = prose.len().saturating_sub(PATH_LOOKBACK_LINES);
    let window = &prose[start..];
    for (regex, confidence) in &patterns().prose_paths {
        for line in window.iter().rev() {
            let found = regex
                .captures_iter(line)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str())
                .find(|p| looks_like_path(p));
            if let Some(path) = found {
                return Some((path.to_string(), *confidence));
            }
        }
    }
    None
}

/// Shell wording in the final line that announces more work.
fn ends_with_intent(text: &str) -> bool {
    let last = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim();
    let lower = last.to_lowercase();
    if last.ends_with(':') || last.ends_with("...") || last.ends_with('\u{2026}') {
        return true;
    }
    ["i will", "i'll", "let me", "i'm going to", "i am going to", "next,", "next i will"]
        .iter()
        .any(|p| lower.starts_with(p) || lower.ends_with(p))
}

/// Extracts synthetic tool calls from free-form prose.
#[derive(Debug, Clone)]
pub struct ProseToolExtractor {
    keys: ProseToolKeys,
    shell_enabled: bool,
    write_enabled: bool,
}

impl ProseToolExtractor {
    /// Only keys the catalog actually lists produce calls.
    pub fn new(keys: ProseToolKeys, catalog: &ToolCatalog) -> Self {
        let shell_enabled = catalog.contains(&keys.shell_tool);
        let write_enabled = catalog.contains(&keys.write_tool);
        Self {
            keys,
            shell_enabled,
            write_enabled,
        }
    }

    pub fn keys(&self) -> &ProseToolKeys {
        &self.keys
    }

    fn shell_call(&self, command: String, confidence: f32) -> ToolInvocation {
        let mut args = Map::new();
        args.insert(self.keys.shell_command_param.clone(), Value::String(command));
        ToolInvocation::new(self.keys.shell_tool.clone(), args)
            .with_origin(InvocationOrigin::ProseExtracted, confidence)
    }

    fn write_call(&self, path: String, content: String, confidence: f32) -> ToolInvocation {
        let mut args = Map::new();
        args.insert(self.keys.write_path_param.clone(), Value::String(path));
        args.insert(self.keys.write_content_param.clone(), Value::String(content));
        ToolInvocation::new(self.keys.write_tool.clone(), args)
            .with_origin(InvocationOrigin::ProseExtracted, confidence)
    }

    fn fence_calls(&self, fence: &Fence<'_>) -> Vec<ToolInvocation> {
        if SHELL_LANGS.contains(&fence.lang.as_str()) {
            if !self.shell_enabled {
                return Vec::new();
            }
            return shell_commands(&fence.body)
                .into_iter()
                .map(|c| self.shell_call(c, TAGGED_SHELL_CONFIDENCE))
                .collect();
        }

        if self.write_enabled {
            if let Some((path, index)) = in_block_path(&fence.body) {
                let content = fence.body[index + 1..].join("\n");
                return vec![self.write_call(path, content, IN_BLOCK_PATH_CONFIDENCE)];
            }
            if let Some((path, confidence)) = prose_path(&fence.prose) {
                return vec![self.write_call(path, fence.body.join("\n"), confidence)];
            }
        }

        let prefixed = first_meaningful_line(&fence.body).is_some_and(|line| {
            patterns()
                .command_prefix
                .as_ref()
                .is_some_and(|r| r.is_match(line))
        });
        if self.shell_enabled && prefixed {
            return shell_commands(&fence.body)
                .into_iter()
                .map(|c| self.shell_call(c, PREFIX_SHELL_CONFIDENCE))
                .collect();
        }
        Vec::new()
    }

    /// Synthetic calls found in `text`, or a completion when the text is a
    /// stand-alone completion statement without code fences.
    pub fn extract(&self, text: &str) -> ParsedTurn {
        if !text.contains("```") {
            let is_completion = patterns()
                .completion
                .as_ref()
                .is_some_and(|r| r.is_match(text));
            if is_completion && !ends_with_intent(text) {
                return ParsedTurn::completion(text.trim())
                    .with_completion_origin(InvocationOrigin::ProseExtracted);
            }
            return ParsedTurn::default();
        }

        let invocations: Vec<ToolInvocation> = fences(text)
            .iter()
            .flat_map(|fence| self.fence_calls(fence))
            .collect();
        if !invocations.is_empty() {
            tracing::debug!(calls = invocations.len(), "extracted tool calls from prose");
        }
        ParsedTurn {
            invocations,
            ..ParsedTurn::default()
        }
    }
}
