//! External tool execution.
//!
//! Provides the typed command descriptor and the runners that execute it.

pub mod command;
#[cfg(test)]
pub mod fake;
pub mod runner;

pub use command::{ExecError, ToolCommand, ToolOutput};
pub use runner::{CommandRunner, DryRunRunner, ProcessRunner};
