//! Worker Model
//!
//! Worker kinds form a closed enum with explicit capability sets; permission
//! checks consult the set rather than string-keyed tables. `WorkerResult` is
//! the immutable record a worker invocation hands back to the scheduler.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Capabilities
// ============================================================================

/// A single capability a worker kind may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadFiles,
    WriteFiles,
    Shell,
    Network,
    Delegate,
}

impl Capability {
    const ALL: [Capability; 5] = [
        Capability::ReadFiles,
        Capability::WriteFiles,
        Capability::Shell,
        Capability::Network,
        Capability::Delegate,
    ];

    fn bit(self) -> u8 {
        match self {
            Capability::ReadFiles => 1,
            Capability::WriteFiles => 1 << 1,
            Capability::Shell => 1 << 2,
            Capability::Network => 1 << 3,
            Capability::Delegate => 1 << 4,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::ReadFiles => write!(f, "read_files"),
            Capability::WriteFiles => write!(f, "write_files"),
            Capability::Shell => write!(f, "shell"),
            Capability::Network => write!(f, "network"),
            Capability::Delegate => write!(f, "delegate"),
        }
    }
}

/// Compact set of capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn of(capabilities: &[Capability]) -> Self {
        capabilities
            .iter()
            .fold(Self::empty(), |set, cap| set.with(*cap))
    }

    pub fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

// ============================================================================
// WorkerKind
// ============================================================================

/// The role a worker plays. Each kind carries a fixed capability set and a
/// default wall-clock budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Reads, writes, and runs commands to change code
    Coder,
    /// Reads local files and queries the network
    Researcher,
    /// Read-only inspection of existing work
    Reviewer,
    /// Writes and runs tests
    Tester,
    /// Tool-less prose generation, served by a single model call
    Writer,
}

impl WorkerKind {
    pub fn capabilities(&self) -> CapabilitySet {
        use Capability::*;
        match self {
            WorkerKind::Coder => CapabilitySet::of(&[ReadFiles, WriteFiles, Shell]),
            WorkerKind::Researcher => CapabilitySet::of(&[ReadFiles, Network]),
            WorkerKind::Reviewer => CapabilitySet::of(&[ReadFiles]),
            WorkerKind::Tester => CapabilitySet::of(&[ReadFiles, WriteFiles, Shell]),
            WorkerKind::Writer => CapabilitySet::empty(),
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(capability)
    }

    /// Kinds with no capabilities are served by a single-shot model call
    /// instead of the tool loop.
    pub fn uses_tools(&self) -> bool {
        !self.capabilities().is_empty()
    }

    /// Default wall-clock budget for one invocation.
    pub fn default_timeout(&self) -> Duration {
        match self {
            WorkerKind::Coder | WorkerKind::Tester => Duration::from_secs(600),
            WorkerKind::Researcher | WorkerKind::Reviewer => Duration::from_secs(300),
            WorkerKind::Writer => Duration::from_secs(120),
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Coder => write!(f, "coder"),
            WorkerKind::Researcher => write!(f, "researcher"),
            WorkerKind::Reviewer => write!(f, "reviewer"),
            WorkerKind::Tester => write!(f, "tester"),
            WorkerKind::Writer => write!(f, "writer"),
        }
    }
}

// ============================================================================
// WorkerResult
// ============================================================================

/// Coarse outcome of one worker invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    Partial,
    Failed,
}

impl WorkerStatus {
    /// Success and partial both resolve a sub-task as completed.
    pub fn is_usable(&self) -> bool {
        matches!(self, WorkerStatus::Success | WorkerStatus::Partial)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Success => write!(f, "success"),
            WorkerStatus::Partial => write!(f, "partial"),
            WorkerStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a worker invocation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The model emitted the completion signal
    Completed,
    /// No-tool turns exceeded the ceiling; the last prose was taken as final
    AcceptedFreeText,
    /// The shared cancellation token fired
    Cancelled,
    /// The per-kind wall-clock budget ran out
    TimedOut,
    /// Repetition detection tripped
    LoopDetected,
    /// The general mistake counter hit its limit
    MistakeLimit,
    /// The step ceiling was reached
    StepLimit,
    /// The model call failed after transport retries
    ModelError,
    /// A single-shot call produced unusable output even after correction
    InvalidOutput,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TerminationReason::Completed => "completed",
            TerminationReason::AcceptedFreeText => "accepted_free_text",
            TerminationReason::Cancelled => "cancelled",
            TerminationReason::TimedOut => "timed_out",
            TerminationReason::LoopDetected => "loop_detected",
            TerminationReason::MistakeLimit => "mistake_limit",
            TerminationReason::StepLimit => "step_limit",
            TerminationReason::ModelError => "model_error",
            TerminationReason::InvalidOutput => "invalid_output",
        };
        write!(f, "{}", label)
    }
}

/// Token counts accumulated over an invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u32,
    pub output: u32,
}

impl TokenCounts {
    pub fn new(input: u32, output: u32) -> Self {
        Self { input, output }
    }

    pub fn add(&mut self, input: u32, output: u32) {
        self.input = self.input.saturating_add(input);
        self.output = self.output.saturating_add(output);
    }

    pub fn total(&self) -> u32 {
        self.input.saturating_add(self.output)
    }
}

/// Immutable result of one worker invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub status: WorkerStatus,
    pub output: String,
    /// Self-reported confidence in `[0, 1]`
    pub confidence: f32,
    pub tokens: TokenCounts,
    pub model: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub termination: TerminationReason,
}

impl WorkerResult {
    /// Start a result with the given outcome. Remaining fields default to empty.
    pub fn new(status: WorkerStatus, termination: TerminationReason) -> Self {
        Self {
            status,
            output: String::new(),
            confidence: 0.0,
            tokens: TokenCounts::default(),
            model: String::new(),
            artifacts: Vec::new(),
            error: None,
            duration_ms: 0,
            termination,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Confidence is clamped into `[0, 1]`.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    pub fn with_tokens(mut self, tokens: TokenCounts) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.termination == TerminationReason::Cancelled
    }

    /// Human-readable reason used when the result is retried or reported.
    pub fn failure_reason(&self) -> String {
        self.error
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| format!("worker stopped: {}", self.termination))
    }
}
