//! Core Services
//!
//! Context compaction shared by the tool loop and the plan scheduler.
//!
//! - `ContextCompactor` - pluggable summarizer for folded turns
//! - `compact_if_needed` - threshold-driven condense-then-evict pass

pub mod compaction;

// ── Pluggable Compaction ─────────────────────────────────────────────
pub use compaction::{
    compact_if_needed, CompactionConfig, CompactionReport, ContextCompactor,
    ExtractiveCompactor, LlmSummaryCompactor,
};
