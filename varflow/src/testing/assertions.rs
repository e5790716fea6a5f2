//! Test assertions for run reports.

use crate::core::{RunStatus, StageState};
use crate::pipeline::PipelineRunReport;

/// Asserts that the run succeeded.
pub fn assert_run_succeeded(report: &PipelineRunReport) {
    assert!(
        report.succeeded(),
        "Expected run to succeed, got {:?} (first failed stage: {:?}, failure: {:?})",
        report.status,
        report.first_failed_stage,
        report.decisive_failure()
    );
}

/// Asserts that the run failed at `stage`.
pub fn assert_run_failed_at(report: &PipelineRunReport, stage: &str) {
    assert_eq!(report.status, RunStatus::Failed, "Expected run to fail");
    assert_eq!(
        report.first_failed_stage.as_deref(),
        Some(stage),
        "Expected first failed stage '{stage}'"
    );
}

/// Asserts the final state of one stage.
pub fn assert_stage_state(report: &PipelineRunReport, stage: &str, expected: StageState) {
    let actual = report.state_of(stage);
    assert_eq!(
        actual,
        Some(expected),
        "Expected stage '{stage}' to be {expected:?}, got {actual:?}"
    );
}

/// Asserts the final state of every stage, in report order.
pub fn assert_stage_states(report: &PipelineRunReport, expected: &[(&str, StageState)]) {
    let actual: Vec<(&str, StageState)> = report
        .stages
        .iter()
        .map(|stage| (stage.stage_name.as_str(), stage.state))
        .collect();
    assert_eq!(actual, expected, "Stage states differ");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageReport;
    use crate::utils::{generate_run_id, now_utc};

    fn report(state: StageState, status: RunStatus) -> PipelineRunReport {
        let mut stage = StageReport::pending("align");
        stage.state = state;
        PipelineRunReport {
            run_id: generate_run_id(),
            pipeline: "p".to_string(),
            started_at: now_utc(),
            status,
            first_failed_stage: (state == StageState::Failed).then(|| "align".to_string()),
            abort_reason: None,
            stages: vec![stage],
            duration_ms: 0,
            invocations_executed: 0,
        }
    }

    #[test]
    fn test_assert_run_succeeded() {
        let report = report(StageState::Succeeded, RunStatus::Succeeded);
        assert_run_succeeded(&report);
        assert_stage_states(&report, &[("align", StageState::Succeeded)]);
    }

    #[test]
    #[should_panic(expected = "Expected run to succeed")]
    fn test_assert_run_succeeded_fails() {
        assert_run_succeeded(&report(StageState::Failed, RunStatus::Failed));
    }

    #[test]
    fn test_assert_run_failed_at() {
        let report = report(StageState::Failed, RunStatus::Failed);
        assert_run_failed_at(&report, "align");
        assert_stage_state(&report, "align", StageState::Failed);
    }
}
