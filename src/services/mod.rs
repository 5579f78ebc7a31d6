//! Services
//!
//! - `context` - conversation state and token accounting
//! - `core` - context compaction
//! - `orchestrator` - tool loop, gateway, loop detection, permissions
//! - `task_mode` - plan scheduling and the submit/cancel service

pub mod context;
pub mod core;
pub mod orchestrator;
pub mod task_mode;
