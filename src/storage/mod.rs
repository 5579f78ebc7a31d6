//! Storage Layer
//!
//! Configuration files and the invocation audit log.

pub mod config;
pub mod invocations;

pub use config::*;
pub use invocations::*;
