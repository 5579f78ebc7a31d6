//! Integration Tests Module
//!
//! End-to-end tests against scripted model and tool doubles: the agentic
//! tool loop on its own, and whole plans through the plan service.

// Scripted LlmProvider / ToolProvider doubles
mod support;

// Tool loop batching, cancellation and loop detection
mod agentic_loop_test;

// Plan scheduling, retries, cycles and cancellation
mod plan_service_test;
