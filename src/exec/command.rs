//! Typed descriptors for external tool invocations.
//!
//! Every AFNI/FSL call the pipeline makes is expressed as a [`ToolCommand`]:
//! the tool name, its argument vector, and the files it is expected to write.
//! Commands are never assembled into shell strings for execution; the
//! rendered command line exists only for logs and reports.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A single external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCommand {
    /// Tool name (e.g. `3dvolreg`, `fslmaths`).
    pub tool: String,
    /// Arguments passed verbatim, no shell interpretation.
    pub args: Vec<String>,
    /// Files the tool must have written for the call to count as successful.
    pub outputs: Vec<PathBuf>,
}

impl ToolCommand {
    /// Start a command for the given tool.
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append a path argument.
    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    /// Append a `--flag=<path>` style argument.
    pub fn flag_path(self, flag: &str, path: &Path) -> Self {
        self.arg(format!("{}={}", flag, path.display()))
    }

    /// Declare a file the tool is expected to produce.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Render the command as a shell-like line for logging.
    pub fn command_line(&self) -> String {
        let mut line = self.tool.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote(arg));
        }
        line
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command_line())
    }
}

fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%#".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Captured result of a finished tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` when killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Successful output with the given stdout.
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Last non-empty line of stdout.
    pub fn last_line(&self) -> Option<&str> {
        self.stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())
    }
}

/// Failure to run an external tool.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{tool} finished but did not produce {}", path.display())]
    MissingOutput { tool: String, path: PathBuf },

    #[error("could not interpret output of {tool}: {detail}")]
    Parse { tool: String, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_quoting() {
        let cmd = ToolCommand::new("3dcalc")
            .arg("-a")
            .arg("rest.nii.gz[4..299]")
            .arg("-expr")
            .arg("a*b")
            .arg("-prefix")
            .arg("out dir/rest_calc.nii.gz");

        assert_eq!(
            cmd.command_line(),
            "3dcalc -a 'rest.nii.gz[4..299]' -expr 'a*b' -prefix 'out dir/rest_calc.nii.gz'"
        );
    }

    #[test]
    fn test_flag_path() {
        let cmd = ToolCommand::new("flameo").flag_path("--cope", Path::new("/m/merged.nii.gz"));
        assert_eq!(cmd.args, vec!["--cope=/m/merged.nii.gz"]);
    }

    #[test]
    fn test_last_line() {
        let out = ToolOutput::with_stdout("++ 3dmaskave: AFNI version\n0.3124 [12345 voxels]\n\n");
        assert_eq!(out.last_line(), Some("0.3124 [12345 voxels]"));
        assert_eq!(ToolOutput::default().last_line(), None);
    }
}
