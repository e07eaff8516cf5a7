//! Command runners.
//!
//! [`CommandRunner`] is the single seam through which the pipeline touches
//! external tools. [`ProcessRunner`] spawns real processes; [`DryRunRunner`]
//! only logs what would run.

use super::command::{ExecError, ToolCommand, ToolOutput};
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Executes [`ToolCommand`]s and reports their captured output.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, command: &'a ToolCommand) -> BoxFuture<'a, Result<ToolOutput, ExecError>>;

    /// Whether commands are only logged; their outputs will not exist.
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Spawns tools as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    /// Tool name -> program to execute instead.
    overrides: HashMap<String, String>,
}

impl ProcessRunner {
    /// Create a runner with program overrides from the `[tools]` config table.
    pub fn with_overrides(overrides: HashMap<String, String>) -> Self {
        Self { overrides }
    }

    /// Program actually launched for a tool.
    pub fn program_for<'a>(&'a self, tool: &'a str) -> &'a str {
        self.overrides.get(tool).map(String::as_str).unwrap_or(tool)
    }

    async fn execute(&self, command: &ToolCommand) -> Result<ToolOutput, ExecError> {
        let program = self.program_for(&command.tool);
        debug!("exec: {}", command.command_line());

        let output = Command::new(program)
            .args(&command.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                tool: command.tool.clone(),
                source,
            })?;

        let captured = ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !output.status.success() {
            let status = match captured.status {
                Some(code) => format!("status {}", code),
                None => "a signal".to_string(),
            };
            warn!("{} failed ({})", command.tool, status);
            return Err(ExecError::Failed {
                tool: command.tool.clone(),
                status,
                stderr: captured.stderr.trim().to_string(),
            });
        }

        for path in &command.outputs {
            if !path.exists() {
                return Err(ExecError::MissingOutput {
                    tool: command.tool.clone(),
                    path: path.clone(),
                });
            }
        }

        Ok(captured)
    }
}

impl CommandRunner for ProcessRunner {
    fn run<'a>(&'a self, command: &'a ToolCommand) -> BoxFuture<'a, Result<ToolOutput, ExecError>> {
        self.execute(command).boxed()
    }
}

/// Logs commands without running them.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunRunner;

impl CommandRunner for DryRunRunner {
    fn run<'a>(&'a self, command: &'a ToolCommand) -> BoxFuture<'a, Result<ToolOutput, ExecError>> {
        async move {
            info!("[dry-run] {}", command.command_line());
            Ok(ToolOutput::with_stdout(""))
        }
        .boxed()
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}
