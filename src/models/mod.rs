//! Data Models
//!
//! Plans, sub-tasks, and plan execution results.

pub mod execution;
pub mod plan;

pub use execution::*;
pub use plan::*;
