//! Tool Execution Types
//!
//! `ToolResult` is what a provider returns; `ToolOutcome` is what the loop
//! appends to the conversation after gating and bookkeeping. `FileRegistry`
//! is the per-loop cache of file contents used for read-dedup, edit
//! guidance, the structural digest, and eviction.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use cascade_llm::estimate_tokens;

/// Result of a tool execution as reported by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the execution was successful
    pub success: bool,
    /// Output from the tool (if successful)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Error message (if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// Create a successful result
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    /// Create an error result
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// Convert to string for model consumption
    pub fn to_content(&self) -> String {
        if self.success {
            self.output.clone().unwrap_or_default()
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("Unknown error")
            )
        }
    }
}

/// Outcome of one gated tool call, as fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub content: String,
    pub latency_ms: u64,
    /// Served from the file registry without reaching the provider
    #[serde(default)]
    pub is_dedup: bool,
}

impl ToolOutcome {
    pub fn from_result(result: &ToolResult, latency_ms: u64) -> Self {
        Self {
            success: result.success,
            content: result.to_content(),
            latency_ms,
            is_dedup: false,
        }
    }

    /// A rejection (permission, ignore list, approval) that never reached the provider.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            content: message.into(),
            latency_ms: 0,
            is_dedup: false,
        }
    }

    pub fn dedup(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            latency_ms: 0,
            is_dedup: true,
        }
    }

    /// First line of the content, capped, for event summaries.
    pub fn summary(&self) -> String {
        let first = self.content.lines().next().unwrap_or("").trim();
        if first.chars().count() > 120 {
            let cut: String = first.chars().take(117).collect();
            format!("{}...", cut)
        } else {
            first.to_string()
        }
    }
}

// ============================================================================
// FileRegistry
// ============================================================================

/// Cached content of one file seen during a loop invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
    pub line_count: usize,
    pub tokens: u32,
    /// Times the file was read from the provider or served from cache
    pub reads: u32,
}

impl FileEntry {
    fn new(path: String, content: String) -> Self {
        Self {
            line_count: content.lines().count(),
            tokens: estimate_tokens(&content),
            path,
            content,
            reads: 1,
        }
    }

    /// Lines `start..=end` (1-based, inclusive). Out-of-range bounds are clamped.
    pub fn slice(&self, start: Option<usize>, end: Option<usize>) -> String {
        if start.is_none() && end.is_none() {
            return self.content.clone();
        }
        let start = start.unwrap_or(1).max(1);
        let end = end.unwrap_or(usize::MAX);
        if end < start {
            return String::new();
        }
        self.content
            .lines()
            .skip(start - 1)
            .take(end - start + 1)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Normalize a path argument so `./src/a.rs` and `src/a.rs` share an entry.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    normalized
}

/// Per-loop file content cache. Never shared across workers.
#[derive(Debug, Default)]
pub struct FileRegistry {
    entries: HashMap<String, FileEntry>,
    touched: BTreeSet<String>,
    written: BTreeSet<String>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a full read of `path`.
    pub fn record_read(&mut self, path: &str, content: impl Into<String>) {
        let key = normalize_path(path);
        self.touched.insert(key.clone());
        let content = content.into();
        match self.entries.get_mut(&key) {
            Some(entry) => {
                let reads = entry.reads + 1;
                *entry = FileEntry::new(key.clone(), content);
                entry.reads = reads;
            }
            None => {
                self.entries.insert(key.clone(), FileEntry::new(key, content));
            }
        }
    }

    /// Record a successful write. Known content refreshes the cache; unknown
    /// content (diff edits) invalidates it.
    pub fn record_write(&mut self, path: &str, content: Option<&str>) {
        let key = normalize_path(path);
        self.touched.insert(key.clone());
        self.written.insert(key.clone());
        match content {
            Some(content) => {
                let reads = self.entries.get(&key).map_or(0, |e| e.reads);
                let mut entry = FileEntry::new(key.clone(), content.to_string());
                entry.reads = reads;
                self.entries.insert(key, entry);
            }
            None => {
                self.entries.remove(&key);
            }
        }
    }

    /// Serve a cached read, counting it as another read.
    pub fn serve(&mut self, path: &str, start: Option<usize>, end: Option<usize>) -> Option<String> {
        let entry = self.entries.get_mut(&normalize_path(path))?;
        entry.reads += 1;
        Some(entry.slice(start, end))
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(&normalize_path(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(&normalize_path(path))
    }

    pub fn invalidate(&mut self, path: &str) -> Option<FileEntry> {
        self.entries.remove(&normalize_path(path))
    }

    /// Every path read or written during the invocation, sorted.
    pub fn touched_paths(&self) -> impl Iterator<Item = &str> {
        self.touched.iter().map(String::as_str)
    }

    /// Paths written during the invocation, sorted.
    pub fn written_paths(&self) -> impl Iterator<Item = &str> {
        self.written.iter().map(String::as_str)
    }

    /// Cached entries, largest first.
    pub fn largest_entries(&self) -> Vec<&FileEntry> {
        let mut entries: Vec<&FileEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| b.tokens.cmp(&a.tokens).then_with(|| a.path.cmp(&b.path)));
        entries
    }

    pub fn total_tokens(&self) -> u32 {
        self.entries.values().map(|e| e.tokens).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result_to_content() {
        assert_eq!(ToolResult::ok("hello").to_content(), "hello");
        assert_eq!(ToolResult::err("boom").to_content(), "Error: boom");
    }

    #[test]
    fn test_outcome_summary_takes_first_line() {
        let outcome = ToolOutcome::from_result(&ToolResult::ok("line one\nline two"), 4);
        assert_eq!(outcome.summary(), "line one");
        assert_eq!(outcome.latency_ms, 4);

        let long = ToolOutcome::rejected("x".repeat(300));
        assert_eq!(long.summary().chars().count(), 120);
        assert!(long.summary().ends_with("..."));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src/lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path(" src\\main.rs "), "src/main.rs");
        assert_eq!(normalize_path("././a"), "a");
    }

    #[test]
    fn test_serve_slices_lines() {
        let mut registry = FileRegistry::new();
        registry.record_read("./a.txt", "one\ntwo\nthree\nfour");
        assert_eq!(registry.serve("a.txt", Some(2), Some(3)).unwrap(), "two\nthree");
        assert_eq!(registry.serve("a.txt", Some(3), None).unwrap(), "three\nfour");
        assert_eq!(registry.serve("a.txt", None, None).unwrap(), "one\ntwo\nthree\nfour");
        assert_eq!(registry.serve("a.txt", Some(5), Some(2)).unwrap(), "");
        assert_eq!(registry.get("a.txt").unwrap().reads, 5);
        assert!(registry.serve("missing.txt", None, None).is_none());
    }

    #[test]
    fn test_write_refreshes_or_invalidates() {
        let mut registry = FileRegistry::new();
        registry.record_read("a.rs", "old");
        registry.record_write("a.rs", Some("new content"));
        assert_eq!(registry.get("a.rs").unwrap().content, "new content");

        registry.record_write("a.rs", None);
        assert!(!registry.contains("a.rs"));
        assert_eq!(registry.touched_paths().collect::<Vec<_>>(), vec!["a.rs"]);
        assert_eq!(registry.written_paths().collect::<Vec<_>>(), vec!["a.rs"]);
    }

    #[test]
    fn test_largest_entries_sorted() {
        let mut registry = FileRegistry::new();
        registry.record_read("small.rs", "x");
        registry.record_read("big.rs", "y".repeat(400));
        registry.record_read("mid.rs", "z".repeat(40));
        let order: Vec<_> = registry.largest_entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(order, vec!["big.rs", "mid.rs", "small.rs"]);
        assert_eq!(registry.total_tokens(), 100 + 10 + 1);
    }
}
