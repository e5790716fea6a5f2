//! Tool invoker backed by real child processes.

use super::invoker::{InvocationRequest, InvocationResult, ToolInvoker};
use crate::cancellation::CancellationToken;
use crate::errors::{InvocationError, StorageError};
use crate::utils::tail_excerpt;
use async_trait::async_trait;
use std::fs::File;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default number of stderr characters kept per invocation.
pub const DEFAULT_STDERR_LIMIT: usize = 4096;

/// How long to wait for the stderr pipe to drain after the child is gone.
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs programs as child processes with `tokio::process`.
///
/// Standard input is closed, standard output goes to the redirect target
/// (or is discarded) and standard error is streamed to `tracing` at debug
/// level while its tail is kept for the result.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    stderr_limit: usize,
    working_dir: Option<PathBuf>,
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self {
            stderr_limit: DEFAULT_STDERR_LIMIT,
            working_dir: None,
        }
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut(Duration),
    Cancelled,
}

impl ProcessInvoker {
    /// Creates an invoker with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many characters of stderr are kept.
    #[must_use]
    pub fn with_stderr_limit(mut self, limit: usize) -> Self {
        self.stderr_limit = limit;
        self
    }

    /// Runs children in `dir` instead of the current directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn spawn(&self, request: &InvocationRequest) -> Result<Child, InvocationError> {
        let stdout = match &request.stdout_target {
            Some(path) => {
                let file = File::create(path).map_err(|source| StorageError::OpenRedirect {
                    path: path.clone(),
                    source,
                })?;
                Stdio::from(file)
            }
            None => Stdio::null(),
        };

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        // The command owns the redirect handle; it is closed when `command`
        // goes out of scope, whether or not the spawn succeeded.
        command.spawn().map_err(|source| InvocationError::Launch {
            program: request.program.clone(),
            source,
        })
    }
}

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, InvocationError> {
        if cancel.is_cancelled() {
            return Err(InvocationError::Cancelled {
                program: request.program.clone(),
                reason: cancel.reason_or_default(),
            });
        }

        debug!(program = %request.program, command = %request.command_line(), "Launching tool");
        let started = Instant::now();
        let mut child = self.spawn(request)?;
        let stderr = child
            .stderr
            .take()
            .map(|pipe| drain_stderr(pipe, request.program.clone(), self.stderr_limit));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            () = deadline(request.timeout) => Outcome::TimedOut(request.timeout.unwrap_or_default()),
            () = cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Exited(Ok(status)) => {
                let duration = started.elapsed();
                let exit_code = exit_code(status);
                let stderr = collect_stderr(stderr, self.stderr_limit).await;
                debug!(
                    program = %request.program,
                    exit_code,
                    duration_ms = crate::utils::duration_ms(duration),
                    "Tool exited"
                );
                Ok(InvocationResult {
                    exit_code,
                    stderr,
                    duration,
                })
            }
            Outcome::Exited(Err(source)) => {
                terminate(&mut child, &request.program).await;
                Err(InvocationError::Wait {
                    program: request.program.clone(),
                    source,
                })
            }
            Outcome::TimedOut(timeout) => {
                warn!(program = %request.program, timeout_ms = crate::utils::duration_ms(timeout), "Tool timed out, killing it");
                terminate(&mut child, &request.program).await;
                Err(InvocationError::Timeout {
                    program: request.program.clone(),
                    timeout,
                    stderr: collect_stderr(stderr, self.stderr_limit).await,
                })
            }
            Outcome::Cancelled => {
                warn!(program = %request.program, "Run cancelled, killing tool");
                terminate(&mut child, &request.program).await;
                Err(InvocationError::Cancelled {
                    program: request.program.clone(),
                    reason: cancel.reason_or_default(),
                })
            }
        }
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
    }
}

async fn terminate(child: &mut Child, program: &str) {
    if let Err(err) = child.kill().await {
        warn!(program = %program, error = %err, "Failed to kill tool");
    }
}

fn drain_stderr<R>(pipe: R, program: String, limit: usize) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut captured = String::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    debug!(program = %program, "{}", text.trim_end());
                    captured.push_str(&text);
                    if captured.len() > limit.saturating_mul(2) {
                        captured = tail_excerpt(&captured, limit);
                    }
                }
                Err(err) => {
                    debug!(program = %program, error = %err, "Stopped reading stderr");
                    break;
                }
            }
        }
        captured
    })
}

async fn collect_stderr(handle: Option<JoinHandle<String>>, limit: usize) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(STDERR_DRAIN_GRACE, handle).await {
        Ok(Ok(captured)) => tail_excerpt(&captured, limit),
        Ok(Err(err)) => {
            debug!(error = %err, "Stderr reader task failed");
            String::new()
        }
        Err(_) => {
            debug!("Stderr pipe still open after the tool exited");
            String::new()
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sh(script: &str) -> InvocationRequest {
        InvocationRequest::new("sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_zero_exit() {
        let invoker = ProcessInvoker::new();
        let result = invoker.invoke(&sh("exit 0"), &CancellationToken::new()).await.unwrap();
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let invoker = ProcessInvoker::new();
        let result = invoker
            .invoke(&sh("echo 'missing index' >&2; exit 1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("missing index"));
    }

    #[tokio::test]
    async fn test_stdout_redirect_truncates_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("variants.vcf");
        fs::write(&target, "stale content that is longer than the new one").unwrap();

        let invoker = ProcessInvoker::new();
        let request = sh("printf '##fileformat=VCFv4.2\\n'").with_stdout(&target);
        invoker.invoke(&request, &CancellationToken::new()).await.unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "##fileformat=VCFv4.2\n");
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let invoker = ProcessInvoker::new();
        let err = invoker
            .invoke(
                &InvocationRequest::new("varflow-definitely-not-installed"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, InvocationError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_unopenable_redirect_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("missing-dir/out.sam");

        let invoker = ProcessInvoker::new();
        let err = invoker
            .invoke(&sh("true").with_stdout(&target), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, InvocationError::Storage(StorageError::OpenRedirect { .. })));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let invoker = ProcessInvoker::new();
        let started = Instant::now();
        let err = invoker
            .invoke(
                &sh("echo 'loading index' >&2; exec sleep 30").with_timeout(Duration::from_millis(500)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(
            matches!(err, InvocationError::Timeout { ref stderr, .. } if stderr.contains("loading index"))
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let invoker = ProcessInvoker::new();
        let cancel = std::sync::Arc::new(CancellationToken::new());
        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel("operator abort");
            })
        };

        let err = invoker.invoke(&sh("exec sleep 30"), &cancel).await.unwrap_err();
        trigger.await.unwrap();

        assert!(
            matches!(err, InvocationError::Cancelled { ref reason, .. } if reason == "operator abort")
        );
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_launch() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let cancel = CancellationToken::new();
        cancel.cancel("stop");

        let invoker = ProcessInvoker::new();
        let script = format!("touch {}", marker.display());
        let err = invoker.invoke(&sh(&script), &cancel).await.unwrap_err();

        assert!(matches!(err, InvocationError::Cancelled { .. }));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_stderr_is_bounded() {
        let invoker = ProcessInvoker::new().with_stderr_limit(64);
        let result = invoker
            .invoke(
                &sh("i=0; while [ $i -lt 200 ]; do echo \"line $i\" >&2; i=$((i+1)); done; echo last >&2"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.stderr.chars().count() <= 64);
        assert!(result.stderr.ends_with("last\n"));
    }
}
