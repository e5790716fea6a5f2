//! Error types for the varflow orchestration engine.
//!
//! Definition-time problems (`DefinitionError`) are raised before any stage
//! runs. Runtime problems are either raised by a component
//! (`StorageError`, `InvocationError`) or recorded per stage in the run
//! report as a `StageFailure`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for varflow operations.
#[derive(Debug, Error)]
pub enum VarflowError {
    /// The pipeline definition is invalid.
    #[error("{0}")]
    Definition(#[from] DefinitionError),

    /// A filesystem operation on an artifact failed.
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// An external tool could not be run.
    #[error("{0}")]
    Invocation(#[from] InvocationError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Metadata about a definition error for better diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "PIPELINE-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a pipeline definition is malformed.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when the implicit stage graph contains a cycle.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle; the first stage is repeated at the end.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "PIPELINE-CYCLE",
            format!("Stage artifacts form a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Make one stage on the cycle stop consuming the other's output.");

        Self {
            cycle_path,
            error_info: info,
        }
    }

    /// Returns the distinct stages participating in the cycle.
    #[must_use]
    pub fn stages(&self) -> &[String] {
        match self.cycle_path.split_last() {
            Some((_, rest)) if !rest.is_empty() => rest,
            _ => &self.cycle_path,
        }
    }
}

/// Error raised when a stage consumes an artifact nobody provides.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' requires artifact '{artifact}', which no stage produces and no input supplies")]
pub struct UnknownArtifactError {
    /// The consuming stage.
    pub stage: String,
    /// The unresolved artifact id.
    pub artifact: String,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl UnknownArtifactError {
    /// Creates a new unknown artifact error.
    #[must_use]
    pub fn new(stage: impl Into<String>, artifact: impl Into<String>) -> Self {
        let stage = stage.into();
        let artifact = artifact.into();
        let info = ContractErrorInfo::new(
            "PIPELINE-UNKNOWN-ARTIFACT",
            format!("Artifact '{artifact}' has no producer"),
        )
        .with_fix_hint("Supply the artifact as a pipeline input or register the stage that produces it.")
        .with_context_entry("stage", stage.clone());

        Self {
            stage,
            artifact,
            error_info: info,
        }
    }
}

/// Any problem found while validating a definition, before a run starts.
#[derive(Debug, Clone, Error)]
pub enum DefinitionError {
    /// Structural problem in a stage or template.
    #[error("{0}")]
    Invalid(#[from] PipelineValidationError),

    /// The stage graph contains a cycle.
    #[error("{0}")]
    Cycle(#[from] CycleDetectedError),

    /// A stage input has no producer.
    #[error("{0}")]
    UnknownArtifact(#[from] UnknownArtifactError),
}

impl DefinitionError {
    /// Returns the contract error info attached to the error.
    #[must_use]
    pub fn error_info(&self) -> Option<&ContractErrorInfo> {
        match self {
            Self::Invalid(err) => err.error_info.as_ref(),
            Self::Cycle(err) => Some(&err.error_info),
            Self::UnknownArtifact(err) => Some(&err.error_info),
        }
    }

    /// Returns the contract error code.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info().map(|info| info.code.as_str())
    }

    /// Returns the stages involved in the error.
    #[must_use]
    pub fn stages(&self) -> Vec<String> {
        match self {
            Self::Invalid(err) => err.stages.clone(),
            Self::Cycle(err) => err.stages().to_vec(),
            Self::UnknownArtifact(err) => vec![err.stage.clone()],
        }
    }
}

/// Errors raised by the artifact store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A directory could not be created.
    #[error("Failed to create directory '{}': {source}", .path.display())]
    CreateDir {
        /// The directory that could not be created.
        path: PathBuf,
        /// The underlying IO error.
        source: io::Error,
    },

    /// A non-directory object occupies a segment of a required path.
    #[error("Path segment '{}' exists and is not a directory", .path.display())]
    NotADirectory {
        /// The offending path segment.
        path: PathBuf,
    },

    /// A redirect target could not be opened for writing.
    #[error("Failed to open '{}' for writing: {source}", .path.display())]
    OpenRedirect {
        /// The redirect target.
        path: PathBuf,
        /// The underlying IO error.
        source: io::Error,
    },

    /// Outputs left in staging by an earlier attempt could not be removed.
    #[error("Failed to clear staging directory '{}': {source}", .path.display())]
    ClearStaging {
        /// The staging directory.
        path: PathBuf,
        /// The underlying IO error.
        source: io::Error,
    },

    /// A staged output could not be moved into place.
    #[error("Failed to move '{}' into place at '{}': {source}", .from.display(), .to.display())]
    Commit {
        /// The staged path.
        from: PathBuf,
        /// The final artifact path.
        to: PathBuf,
        /// The underlying IO error.
        source: io::Error,
    },
}

/// Errors raised by a tool invoker.
///
/// A non-zero exit status is not an error at this level; the runner
/// classifies it.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The executable could not be found or started.
    #[error("Failed to launch '{program}': {source}")]
    Launch {
        /// The program that failed to start.
        program: String,
        /// The underlying IO error.
        source: io::Error,
    },

    /// Waiting on the child process failed after it started.
    #[error("Lost track of '{program}' while waiting for it: {source}")]
    Wait {
        /// The running program.
        program: String,
        /// The underlying IO error.
        source: io::Error,
    },

    /// The child exceeded its time limit and was terminated.
    #[error("'{program}' timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// The program that timed out.
        program: String,
        /// The limit that was exceeded.
        timeout: Duration,
        /// Stderr captured before the child was killed.
        stderr: String,
    },

    /// The child was terminated because the run was cancelled.
    #[error("'{program}' was terminated: {reason}")]
    Cancelled {
        /// The program that was terminated.
        program: String,
        /// The cancellation reason.
        reason: String,
    },

    /// The redirect target could not be prepared.
    #[error("{0}")]
    Storage(#[from] StorageError),
}

/// Why a stage ended up `Failed` or `Aborted`, as recorded in the run report.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageFailure {
    /// An executable could not be found or started.
    #[error("Failed to launch '{program}': {message}")]
    Launch {
        /// The program that failed to start.
        program: String,
        /// The launch error.
        message: String,
    },

    /// A tool exited with a non-zero status.
    #[error("'{program}' exited with code {exit_code}")]
    Execution {
        /// The failing program.
        program: String,
        /// Its exit code.
        exit_code: i32,
    },

    /// A tool exceeded its time limit.
    #[error("'{program}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The program that timed out.
        program: String,
        /// The limit that was exceeded.
        timeout_ms: u64,
    },

    /// A required path could not be created or written.
    #[error("Storage failure: {message}")]
    Storage {
        /// The storage error.
        message: String,
    },

    /// A required input was absent when the stage became eligible.
    #[error("Required input '{artifact}' is missing at '{}'", .path.display())]
    MissingInput {
        /// The missing artifact id.
        artifact: String,
        /// Where it was expected.
        path: PathBuf,
    },

    /// A declared output was absent after every invocation succeeded.
    #[error("Declared output '{artifact}' is missing or incomplete at '{}'", .path.display())]
    MissingOutput {
        /// The missing artifact id.
        artifact: String,
        /// Where it was expected.
        path: PathBuf,
    },

    /// The operator cancelled the run.
    #[error("Aborted: {reason}")]
    Aborted {
        /// The cancellation reason.
        reason: String,
    },
}

impl StageFailure {
    /// Returns true if re-running the stage could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution { .. } | Self::Timeout { .. })
    }

    /// Returns true if the failure is an operator abort.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

impl From<StorageError> for StageFailure {
    fn from(err: StorageError) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<InvocationError> for StageFailure {
    fn from(err: InvocationError) -> Self {
        match err {
            InvocationError::Launch { program, source } => Self::Launch {
                program,
                message: source.to_string(),
            },
            InvocationError::Wait { program, source } => Self::Launch {
                program,
                message: format!("wait failed: {source}"),
            },
            InvocationError::Timeout { program, timeout, .. } => Self::Timeout {
                program,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            InvocationError::Cancelled { reason, .. } => Self::Aborted { reason },
            InvocationError::Storage(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "align");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"align".to_string()));
    }

    #[test]
    fn test_cycle_detected_error() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> c -> a"));
        assert_eq!(err.error_info.code, "PIPELINE-CYCLE");
        assert_eq!(err.stages(), ["a", "b", "c"]);
    }

    #[test]
    fn test_unknown_artifact_error() {
        let err = UnknownArtifactError::new("sort", "aligned_bam");
        assert!(err.to_string().contains("'aligned_bam'"));

        let def: DefinitionError = err.into();
        assert_eq!(def.stages(), vec!["sort".to_string()]);
        assert_eq!(def.error_info().map(|i| i.code.as_str()), Some("PIPELINE-UNKNOWN-ARTIFACT"));
    }

    #[test]
    fn test_launch_error_maps_to_launch_failure() {
        let err = InvocationError::Launch {
            program: "bwa".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
        };
        let failure = StageFailure::from(err);

        assert!(matches!(failure, StageFailure::Launch { ref program, .. } if program == "bwa"));
        assert!(!failure.is_retryable());
    }

    #[test]
    fn test_cancelled_invocation_maps_to_abort() {
        let failure = StageFailure::from(InvocationError::Cancelled {
            program: "freebayes".to_string(),
            reason: "operator abort".to_string(),
        });
        assert!(failure.is_abort());
    }

    #[test]
    fn test_stage_failure_serializes_with_kind_tag() {
        let failure = StageFailure::Execution {
            program: "freebayes".to_string(),
            exit_code: 1,
        };
        let json = serde_json::to_value(&failure).unwrap();

        assert_eq!(json["kind"], "execution");
        assert_eq!(json["exit_code"], 1);
        assert!(failure.is_retryable());
    }
}
