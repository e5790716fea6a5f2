//! The run report: per-stage outcome and overall status.

use crate::core::{RunStatus, StageState};
use crate::errors::{StageFailure, VarflowError};
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// What happened to one stage during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// Stage name.
    pub stage_name: String,
    /// Final state.
    pub state: StageState,
    /// Exit code of each invocation that ran in the last attempt, in order.
    pub exit_codes: Vec<i32>,
    /// Wall-clock time spent on the stage, across attempts.
    pub duration_ms: u64,
    /// Tail of the failing tool's stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_excerpt: Option<String>,
    /// Why the stage failed or was aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
    /// Number of attempts made.
    #[serde(default)]
    pub attempts: u32,
}

impl StageReport {
    /// Creates a report for a stage that has not been considered.
    #[must_use]
    pub fn pending(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            state: StageState::Pending,
            exit_codes: Vec::new(),
            duration_ms: 0,
            stderr_excerpt: None,
            failure: None,
            attempts: 0,
        }
    }

    /// Returns true if the stage ended Succeeded or Skipped.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }
}

/// The outcome of a complete pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRunReport {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// When the run started.
    pub started_at: Timestamp,
    /// Overall status.
    pub status: RunStatus,
    /// The first stage that failed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failed_stage: Option<String>,
    /// Cancellation reason, if the operator aborted the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    /// Stages in resolved order.
    pub stages: Vec<StageReport>,
    /// Total wall-clock time.
    pub duration_ms: u64,
    /// Number of external programs launched.
    pub invocations_executed: usize,
}

impl PipelineRunReport {
    /// Returns true if the run succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Returns true if the run was aborted by the operator.
    #[must_use]
    pub fn was_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }

    /// Returns the report for the named stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|stage| stage.stage_name == name)
    }

    /// Returns the state of the named stage.
    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<StageState> {
        self.stage(name).map(|stage| stage.state)
    }

    /// Returns the failure that decided the run, if any.
    #[must_use]
    pub fn decisive_failure(&self) -> Option<&StageFailure> {
        self.stages
            .iter()
            .find(|stage| matches!(stage.state, StageState::Failed | StageState::Aborted))
            .and_then(|stage| stage.failure.as_ref())
    }

    /// Serializes the report as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, VarflowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the report as pretty JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), VarflowError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{generate_run_id, now_utc};
    use tempfile::TempDir;

    fn failed_report() -> PipelineRunReport {
        let mut align = StageReport::pending("align");
        align.state = StageState::Succeeded;
        align.exit_codes = vec![0, 0, 0];

        let mut call = StageReport::pending("call-variants");
        call.state = StageState::Failed;
        call.exit_codes = vec![1];
        call.stderr_excerpt = Some("missing index\n".to_string());
        call.failure = Some(StageFailure::Execution {
            program: "freebayes".to_string(),
            exit_code: 1,
        });

        PipelineRunReport {
            run_id: generate_run_id(),
            pipeline: "variant-calling".to_string(),
            started_at: now_utc(),
            status: RunStatus::Failed,
            first_failed_stage: Some("call-variants".to_string()),
            abort_reason: None,
            stages: vec![align, call],
            duration_ms: 12,
            invocations_executed: 4,
        }
    }

    #[test]
    fn test_report_json_shape() {
        let json: serde_json::Value = serde_json::from_str(&failed_report().to_json().unwrap()).unwrap();

        assert_eq!(json["status"], "failed");
        assert_eq!(json["first_failed_stage"], "call-variants");
        assert_eq!(json["stages"][0]["stage_name"], "align");
        assert_eq!(json["stages"][0]["state"], "succeeded");
        assert!(json["stages"][0].get("stderr_excerpt").is_none());
        assert_eq!(json["stages"][1]["exit_codes"][0], 1);
        assert_eq!(json["stages"][1]["failure"]["kind"], "execution");
        assert!(json.get("abort_reason").is_none());
    }

    #[test]
    fn test_report_lookups() {
        let report = failed_report();
        assert!(!report.succeeded());
        assert!(!report.was_aborted());
        assert_eq!(report.state_of("align"), Some(StageState::Succeeded));
        assert!(matches!(
            report.decisive_failure(),
            Some(StageFailure::Execution { exit_code: 1, .. })
        ));
    }

    #[test]
    fn test_write_json_creates_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports/run.json");
        let report = failed_report();

        report.write_json(&path).unwrap();

        let loaded: PipelineRunReport = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, report);
    }
}
