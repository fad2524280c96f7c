//! Test execution
//!
//! Runs the external interop test binary against a provisioned environment.

mod runner;

pub use runner::{ExecError, TestRunner};
