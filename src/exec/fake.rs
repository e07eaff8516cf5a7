//! Recording runner used by pipeline and driver tests.

use super::command::{ExecError, ToolCommand, ToolOutput};
use super::runner::CommandRunner;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Mutex;

type Responder = Box<dyn Fn(&ToolCommand) -> String + Send + Sync>;

/// Records every command, touches declared outputs, and answers with
/// canned stdout.
pub struct FakeRunner {
    calls: Mutex<Vec<ToolCommand>>,
    responder: Responder,
    fail_tool: Option<String>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::responding(|_| String::new())
    }

    /// Runner whose stdout is produced by `responder` (which may also create
    /// files to model tool side effects).
    pub fn responding<F>(responder: F) -> Self
    where
        F: Fn(&ToolCommand) -> String + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            fail_tool: None,
        }
    }

    /// Make every invocation of `tool` fail.
    pub fn failing_on(mut self, tool: &str) -> Self {
        self.fail_tool = Some(tool.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tools(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.tool).collect()
    }

    pub fn calls_to(&self, tool: &str) -> Vec<ToolCommand> {
        self.calls().into_iter().filter(|c| c.tool == tool).collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run<'a>(&'a self, command: &'a ToolCommand) -> BoxFuture<'a, Result<ToolOutput, ExecError>> {
        async move {
            self.calls.lock().unwrap().push(command.clone());

            if self.fail_tool.as_deref() == Some(command.tool.as_str()) {
                return Err(ExecError::Failed {
                    tool: command.tool.clone(),
                    status: "status 1".to_string(),
                    stderr: "simulated failure".to_string(),
                });
            }

            for path in &command.outputs {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).unwrap();
                }
                std::fs::write(path, b"").unwrap();
            }

            Ok(ToolOutput::with_stdout((self.responder)(command)))
        }
        .boxed()
    }
}
