//! Mock tool invokers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::core::ArtifactKind;
use crate::errors::{InvocationError, StorageError};
use crate::tools::{InvocationRequest, InvocationResult, ToolInvoker};

/// Name of the file written into directory outputs.
pub const DIRECTORY_MARKER: &str = "report.txt";

/// How a scripted tool behaves when invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBehavior {
    /// Exit code once the tool stops failing.
    pub exit_code: i32,
    /// Text written to stderr.
    pub stderr: String,
    /// Fail to launch instead of running.
    pub launch_error: bool,
    /// Write every declared output on success.
    pub write_outputs: bool,
    /// Exit with `failing_exit_code` for this many calls before behaving normally.
    pub fail_times: u32,
    /// Exit code used while `fail_times` has not run out.
    pub failing_exit_code: i32,
    /// Simulated running time.
    pub delay: Option<Duration>,
}

impl Default for ToolBehavior {
    fn default() -> Self {
        Self {
            exit_code: 0,
            stderr: String::new(),
            launch_error: false,
            write_outputs: true,
            fail_times: 0,
            failing_exit_code: 1,
            delay: None,
        }
    }
}

impl ToolBehavior {
    /// A tool that succeeds and writes its outputs.
    #[must_use]
    pub fn succeed() -> Self {
        Self::default()
    }

    /// A tool that exits with `code` and writes nothing.
    #[must_use]
    pub fn exit_with(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: code,
            stderr: stderr.into(),
            write_outputs: false,
            ..Self::default()
        }
    }

    /// A tool whose executable cannot be found.
    #[must_use]
    pub fn missing() -> Self {
        Self {
            launch_error: true,
            ..Self::default()
        }
    }

    /// A tool that exits 0 but forgets to write its outputs.
    #[must_use]
    pub fn silent() -> Self {
        Self {
            write_outputs: false,
            ..Self::default()
        }
    }

    /// A tool that fails `times` times before succeeding.
    #[must_use]
    pub fn flaky(times: u32) -> Self {
        Self {
            fail_times: times,
            ..Self::default()
        }
    }

    /// Adds a simulated running time.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A tool invoker that never launches a process.
///
/// Behaviors are looked up by `"<program> <first arg>"` first and then by
/// program name, so `samtools sort` and `samtools index` can be scripted
/// separately. Unscripted programs succeed.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    behaviors: Mutex<HashMap<String, ToolBehavior>>,
    calls: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<InvocationRequest>>,
}

impl ScriptedInvoker {
    /// Creates an invoker where every tool succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a tool.
    #[must_use]
    pub fn with(self, key: impl Into<String>, behavior: ToolBehavior) -> Self {
        self.set(key, behavior);
        self
    }

    /// Replaces the behavior of a tool.
    pub fn set(&self, key: impl Into<String>, behavior: ToolBehavior) {
        self.behaviors.lock().insert(key.into(), behavior);
    }

    /// Returns every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<InvocationRequest> {
        self.requests.lock().clone()
    }

    /// Returns the command lines received, in order.
    #[must_use]
    pub fn command_lines(&self) -> Vec<String> {
        self.requests.lock().iter().map(InvocationRequest::command_line).collect()
    }

    /// Returns the total number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns how often `program` was invoked.
    #[must_use]
    pub fn calls_to(&self, program: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.program == program)
            .count()
    }

    /// Forgets recorded requests and call counts, keeping the behaviors.
    pub fn reset(&self) {
        self.requests.lock().clear();
        self.calls.lock().clear();
    }

    fn behavior_for(&self, request: &InvocationRequest) -> (String, ToolBehavior) {
        let behaviors = self.behaviors.lock();
        if let Some(first) = request.args.first() {
            let key = format!("{} {first}", request.program);
            if let Some(behavior) = behaviors.get(&key) {
                return (key, behavior.clone());
            }
        }
        let behavior = behaviors.get(&request.program).cloned().unwrap_or_default();
        (request.program.clone(), behavior)
    }

    async fn write_outputs(request: &InvocationRequest) -> Result<(), StorageError> {
        for target in &request.produces {
            match target.kind {
                ArtifactKind::File => write_file(&target.path, &request.program).await?,
                ArtifactKind::Directory => {
                    tokio::fs::create_dir_all(&target.path)
                        .await
                        .map_err(|source| StorageError::CreateDir {
                            path: target.path.clone(),
                            source,
                        })?;
                    write_file(&target.path.join(DIRECTORY_MARKER), &request.program).await?;
                }
            }
        }
        Ok(())
    }
}

async fn write_file(path: &Path, program: &str) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::write(path, format!("written by {program}\n"))
        .await
        .map_err(|source| StorageError::OpenRedirect {
            path: path.to_path_buf(),
            source,
        })
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, InvocationError> {
        self.requests.lock().push(request.clone());
        let (key, behavior) = self.behavior_for(request);

        if cancel.is_cancelled() {
            return Err(InvocationError::Cancelled {
                program: request.program.clone(),
                reason: cancel.reason_or_default(),
            });
        }
        if behavior.launch_error {
            return Err(InvocationError::Launch {
                program: request.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            });
        }

        if let Some(delay) = behavior.delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    return Err(InvocationError::Cancelled {
                        program: request.program.clone(),
                        reason: cancel.reason_or_default(),
                    });
                }
            }
        }

        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(key).or_insert(0);
            *count += 1;
            *count
        };
        let exit_code = if call <= behavior.fail_times {
            behavior.failing_exit_code
        } else {
            behavior.exit_code
        };

        if exit_code == 0 && behavior.write_outputs {
            Self::write_outputs(request).await?;
        }

        Ok(InvocationResult {
            exit_code,
            stderr: behavior.stderr,
            duration: behavior.delay.unwrap_or_default(),
        })
    }
}
