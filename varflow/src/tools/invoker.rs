//! The command-execution seam between the runner and external tools.

use crate::cancellation::CancellationToken;
use crate::core::ArtifactKind;
use crate::errors::InvocationError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// A fully resolved external command, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    /// Program name or path.
    pub program: String,
    /// Rendered arguments, in order.
    pub args: Vec<String>,
    /// File that receives standard output, truncated before the program starts.
    pub stdout_target: Option<PathBuf>,
    /// Time limit; the child is killed when it is exceeded.
    pub timeout: Option<Duration>,
    /// Output locations this invocation is expected to write.
    pub produces: Vec<OutputTarget>,
}

/// Where an invocation is expected to write one of its stage's outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    /// Artifact id.
    pub artifact: String,
    /// Resolved path the tool writes to.
    pub path: PathBuf,
    /// File or directory.
    pub kind: ArtifactKind,
}

impl InvocationRequest {
    /// Creates a request for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout_target: None,
            timeout: None,
            produces: Vec::new(),
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Redirects standard output to `path`.
    #[must_use]
    pub fn with_stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_target = Some(path.into());
        self
    }

    /// Sets the time limit.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Records an output location the invocation writes.
    #[must_use]
    pub fn with_output(mut self, target: OutputTarget) -> Self {
        self.produces.push(target);
        self
    }

    /// Returns the command line as a single display string.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The outcome of a program that was launched and exited on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    /// Exit code. Signal deaths are reported as `128 + signal`.
    pub exit_code: i32,
    /// Tail of the program's standard error.
    pub stderr: String,
    /// Wall-clock time from launch to exit.
    pub duration: Duration,
}

impl InvocationResult {
    /// Returns true if the program exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes external programs for the runner.
///
/// A non-zero exit is returned as an `InvocationResult`, not an error.
/// Errors are reserved for programs that could not be started, that
/// exceeded their time limit, or that were killed by cancellation.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Runs one command to completion.
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, InvocationError>;
}
