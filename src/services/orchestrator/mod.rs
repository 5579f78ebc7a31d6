//! Worker Orchestration
//!
//! Everything one worker invocation needs: the agentic tool loop, the gate
//! every tool call passes through, repetition detection, the permission and
//! approval ports, and the single-shot path for tool-less workers.

pub mod agentic_loop;
pub mod gateway;
pub mod loop_detector;
pub mod permissions;
pub mod self_correction;

pub use agentic_loop::{
    build_task_message, completion_tool_definition, tag_protocol_instructions, AgenticToolLoop,
    AgenticToolLoopBuilder, LoopConfig,
};
pub use gateway::{GatedOutcome, GatewayConfig, GatewaySession, IgnoreList, ToolExecutionGateway};
pub use loop_detector::{
    canonical_signature, DetectorConfig, DetectorVerdict, MistakeCounters, RepetitionDetector,
    StuckSignal,
};
pub use permissions::{
    classify_tool_risk, needs_approval, ApprovalHandler, ApprovalRequest, ApprovalResponse,
    AutoApprove, CapabilityPermissionPolicy, ChannelApprovalHandler, PermissionDecision,
    PermissionLevel, PermissionPolicy, ToolRisk,
};
pub use self_correction::{
    is_correctable, OutputValidator, SingleShotConfig, SingleShotRunner, CORRECTED_CONFIDENCE,
    FIRST_ATTEMPT_CONFIDENCE,
};
