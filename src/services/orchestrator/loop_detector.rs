//! Repetition and Mistake Tracking
//!
//! Detects a worker stuck repeating itself using four per-call signals:
//!
//! 1. Consecutive identical calls (canonical tool + sorted-key arguments).
//! 2. The same canonical call seen repeatedly anywhere in history.
//! 3. One tool name called too often in total (warn, then stop).
//! 4. One tool name called many times in a row regardless of arguments
//!    (warn, then stop).
//!
//! `MistakeCounters` is the independent monotone error budget plus the
//! per-file edit failure counts that drive edit guidance.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cascade_tools::normalize_path;

fn default_consecutive_threshold() -> u32 {
    3
}

fn default_history_threshold() -> u32 {
    3
}

fn default_tool_frequency_threshold() -> u32 {
    8
}

fn default_tool_streak_threshold() -> u32 {
    5
}

/// Thresholds for the repetition signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_consecutive_threshold")]
    pub consecutive_threshold: u32,
    #[serde(default = "default_history_threshold")]
    pub history_threshold: u32,
    #[serde(default = "default_tool_frequency_threshold")]
    pub tool_frequency_threshold: u32,
    #[serde(default = "default_tool_streak_threshold")]
    pub tool_streak_threshold: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            consecutive_threshold: default_consecutive_threshold(),
            history_threshold: default_history_threshold(),
            tool_frequency_threshold: default_tool_frequency_threshold(),
            tool_streak_threshold: default_tool_streak_threshold(),
        }
    }
}

/// Which signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckSignal {
    ConsecutiveRepeat,
    HistoryRepeat,
    ToolFrequency,
    ToolStreak,
}

/// Result of recording one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorVerdict {
    Clear,
    /// Inject the message as a notice and keep going
    Warn { signal: StuckSignal, message: String },
    /// Terminate the loop
    Stop { signal: StuckSignal, message: String },
}

impl DetectorVerdict {
    pub fn is_stop(&self) -> bool {
        matches!(self, DetectorVerdict::Stop { .. })
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

/// `tool` plus arguments serialized with sorted keys.
pub fn canonical_signature(tool: &str, args: &Map<String, Value>) -> String {
    let canonical = canonicalize(&Value::Object(args.clone()));
    format!("{}:{}", tool, canonical)
}

/// Per-invocation repetition tracker.
#[derive(Debug, Default)]
pub struct RepetitionDetector {
    config: DetectorConfig,
    last_signature: Option<String>,
    consecutive: u32,
    signature_counts: HashMap<String, u32>,
    tool_counts: HashMap<String, u32>,
    streak_tool: Option<String>,
    streak: u32,
}

impl RepetitionDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Record one call and evaluate every signal. Stops take precedence over
    /// warnings.
    pub fn record(&mut self, tool: &str, args: &Map<String, Value>) -> DetectorVerdict {
        let signature = canonical_signature(tool, args);

        if self.last_signature.as_deref() == Some(signature.as_str()) {
            self.consecutive += 1;
        } else {
            self.last_signature = Some(signature.clone());
            self.consecutive = 1;
        }

        let seen = self.signature_counts.entry(signature).or_insert(0);
        *seen += 1;
        let seen = *seen;

        let total = self.tool_counts.entry(tool.to_string()).or_insert(0);
        *total += 1;
        let total = *total;

        if self.streak_tool.as_deref() == Some(tool) {
            self.streak += 1;
        } else {
            self.streak_tool = Some(tool.to_string());
            self.streak = 1;
        }

        if self.consecutive >= self.config.consecutive_threshold {
            return DetectorVerdict::Stop {
                signal: StuckSignal::ConsecutiveRepeat,
                message: format!(
                    "The identical call to {} was made {} times in a row. Stopping to avoid an infinite loop.",
                    tool, self.consecutive
                ),
            };
        }
        if seen >= self.config.history_threshold {
            return DetectorVerdict::Stop {
                signal: StuckSignal::HistoryRepeat,
                message: format!(
                    "The identical call to {} has been made {} times during this task. Stopping to avoid an infinite loop.",
                    tool, seen
                ),
            };
        }

        let frequency = self.config.tool_frequency_threshold.max(1);
        if total >= frequency * 2 {
            return DetectorVerdict::Stop {
                signal: StuckSignal::ToolFrequency,
                message: format!("{} has been called {} times. Stopping.", tool, total),
            };
        }
        let streak_limit = self.config.tool_streak_threshold.max(1);
        if self.streak >= streak_limit * 2 {
            return DetectorVerdict::Stop {
                signal: StuckSignal::ToolStreak,
                message: format!("{} has been called {} times in a row. Stopping.", tool, self.streak),
            };
        }

        if total == frequency {
            return DetectorVerdict::Warn {
                signal: StuckSignal::ToolFrequency,
                message: format!(
                    "{} has been called {} times. Use the results you already have and move toward completing the task.",
                    tool, total
                ),
            };
        }
        if self.streak == streak_limit {
            return DetectorVerdict::Warn {
                signal: StuckSignal::ToolStreak,
                message: format!(
                    "{} has been called {} times in a row. Try a different approach or complete the task.",
                    tool, self.streak
                ),
            };
        }

        DetectorVerdict::Clear
    }

    pub fn total_calls(&self, tool: &str) -> u32 {
        self.tool_counts.get(tool).copied().unwrap_or(0)
    }
}

// ============================================================================
// MistakeCounters
// ============================================================================

/// Error counters scoped to one loop invocation.
#[derive(Debug, Clone, Default)]
pub struct MistakeCounters {
    general_errors: u32,
    no_tool_use: u32,
    no_response: u32,
    edit_errors: HashMap<String, u32>,
}

impl MistakeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tool_failure(&mut self) {
        self.general_errors += 1;
    }

    /// Count a turn with neither tool call nor completion. Turns past the
    /// grace count also count as general mistakes. Returns the streak.
    pub fn record_no_tool_use(&mut self, grace: u32) -> u32 {
        self.no_tool_use += 1;
        if self.no_tool_use > grace {
            self.general_errors += 1;
        }
        self.no_tool_use
    }

    pub fn reset_no_tool_use(&mut self) {
        self.no_tool_use = 0;
    }

    pub fn record_no_response(&mut self) -> u32 {
        self.no_response += 1;
        self.no_response
    }

    /// Bump the edit failure count of one file and return it.
    pub fn record_edit_failure(&mut self, path: &str) -> u32 {
        let count = self.edit_errors.entry(normalize_path(path)).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset_edit_failures(&mut self, path: &str) {
        self.edit_errors.remove(&normalize_path(path));
    }

    pub fn edit_failures(&self, path: &str) -> u32 {
        self.edit_errors.get(&normalize_path(path)).copied().unwrap_or(0)
    }

    pub fn general_errors(&self) -> u32 {
        self.general_errors
    }

    pub fn no_tool_use(&self) -> u32 {
        self.no_tool_use
    }

    pub fn no_response(&self) -> u32 {
        self.no_response
    }

    pub fn exceeded(&self, limit: u32) -> bool {
        self.general_errors >= limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_canonical_signature_ignores_key_order() {
        let a = canonical_signature("grep", &args(json!({"pattern": "x", "path": "src"})));
        let b = canonical_signature("grep", &args(json!({"path": "src", "pattern": "x"})));
        assert_eq!(a, b);
    }

    #[test]
    fn test_three_identical_calls_stop() {
        let mut detector = RepetitionDetector::new(DetectorConfig::default());
        let call = args(json!({"path": "a.rs"}));
        assert_eq!(detector.record("read_file", &call), DetectorVerdict::Clear);
        assert_eq!(detector.record("read_file", &call), DetectorVerdict::Clear);
        match detector.record("read_file", &call) {
            DetectorVerdict::Stop { signal, .. } => assert_eq!(signal, StuckSignal::ConsecutiveRepeat),
            other => panic!("expected stop, got {:?}", other),
        }
    }

    #[test]
    fn test_interleaving_resets_streak_but_not_history() {
        let mut detector = RepetitionDetector::new(DetectorConfig::default());
        let a = args(json!({"path": "a.rs"}));
        let b = args(json!({"path": "b.rs"}));
        assert!(!detector.record("read_file", &a).is_stop());
        assert!(!detector.record("read_file", &a).is_stop());
        assert!(!detector.record("read_file", &b).is_stop());
        match detector.record("read_file", &a) {
            DetectorVerdict::Stop { signal, .. } => assert_eq!(signal, StuckSignal::HistoryRepeat),
            other => panic!("expected stop, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_frequency_warns_then_stops() {
        let mut detector = RepetitionDetector::new(DetectorConfig::default());
        let mut verdicts = Vec::new();
        for i in 0..16 {
            // Alternate tools so the streak signal stays quiet.
            verdicts.push(detector.record("search", &args(json!({"q": i}))));
            detector.record("list", &args(json!({"i": i})));
        }
        assert!(matches!(
            verdicts[7],
            DetectorVerdict::Warn { signal: StuckSignal::ToolFrequency, .. }
        ));
        assert!(verdicts[8..15].iter().all(|v| !v.is_stop()));
        assert!(matches!(
            verdicts[15],
            DetectorVerdict::Stop { signal: StuckSignal::ToolFrequency, .. }
        ));
    }

    #[test]
    fn test_same_tool_streak_warns() {
        let config = DetectorConfig {
            tool_frequency_threshold: 100,
            ..Default::default()
        };
        let mut detector = RepetitionDetector::new(config);
        let verdicts: Vec<DetectorVerdict> = (0..10)
            .map(|i| detector.record("execute_command", &args(json!({"command": format!("echo {}", i)}))))
            .collect();
        assert!(matches!(
            verdicts[4],
            DetectorVerdict::Warn { signal: StuckSignal::ToolStreak, .. }
        ));
        assert!(matches!(
            verdicts[9],
            DetectorVerdict::Stop { signal: StuckSignal::ToolStreak, .. }
        ));
    }

    #[test]
    fn test_mistake_counters() {
        let mut counters = MistakeCounters::new();
        assert_eq!(counters.record_no_tool_use(2), 1);
        assert_eq!(counters.record_no_tool_use(2), 2);
        assert_eq!(counters.general_errors(), 0);
        counters.record_no_tool_use(2);
        assert_eq!(counters.general_errors(), 1);
        counters.reset_no_tool_use();
        assert_eq!(counters.no_tool_use(), 0);

        counters.record_tool_failure();
        assert!(counters.exceeded(2));
        assert!(!counters.exceeded(3));
    }

    #[test]
    fn test_edit_failures_per_file() {
        let mut counters = MistakeCounters::new();
        assert_eq!(counters.record_edit_failure("./src/a.rs"), 1);
        assert_eq!(counters.record_edit_failure("src/a.rs"), 2);
        assert_eq!(counters.edit_failures("src/b.rs"), 0);
        counters.reset_edit_failures("src/a.rs");
        assert_eq!(counters.edit_failures("src/a.rs"), 0);
    }
}
