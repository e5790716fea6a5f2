//! Stage and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The state of one stage within a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not yet considered.
    #[default]
    Pending,
    /// Outputs already existed; nothing was executed.
    Skipped,
    /// Invocations are executing.
    Running,
    /// Every invocation exited zero and every output exists.
    Succeeded,
    /// The stage could not complete.
    Failed,
    /// An earlier stage failed, so this one was never considered.
    NotAttempted,
    /// The operator cancelled the run while this stage was running or pending.
    Aborted,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Skipped => write!(f, "skipped"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::NotAttempted => write!(f, "not_attempted"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl StageState {
    /// Returns true if the state is final for the run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true if the stage's outputs are known to be present.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Returns true if the transition `self -> next` is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Skipped | Self::Running | Self::Failed | Self::NotAttempted | Self::Aborted
            ),
            Self::Running => matches!(next, Self::Succeeded | Self::Failed | Self::Aborted),
            _ => false,
        }
    }
}

/// Overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run has not started.
    #[default]
    Pending,
    /// Stages are being processed.
    Running,
    /// Every stage succeeded or was skipped.
    Succeeded,
    /// At least one stage failed or was aborted.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_state_display() {
        assert_eq!(StageState::Skipped.to_string(), "skipped");
        assert_eq!(StageState::NotAttempted.to_string(), "not_attempted");
        assert_eq!(StageState::Aborted.to_string(), "aborted");
    }

    #[test]
    fn test_stage_state_is_terminal() {
        assert!(StageState::Skipped.is_terminal());
        assert!(StageState::Succeeded.is_terminal());
        assert!(StageState::Failed.is_terminal());
        assert!(StageState::NotAttempted.is_terminal());
        assert!(!StageState::Pending.is_terminal());
        assert!(!StageState::Running.is_terminal());
    }

    #[test]
    fn test_stage_state_transitions() {
        assert!(StageState::Pending.can_transition_to(StageState::Skipped));
        assert!(StageState::Pending.can_transition_to(StageState::Running));
        assert!(StageState::Pending.can_transition_to(StageState::Failed));
        assert!(StageState::Running.can_transition_to(StageState::Succeeded));
        assert!(StageState::Running.can_transition_to(StageState::Aborted));

        assert!(!StageState::Pending.can_transition_to(StageState::Succeeded));
        assert!(!StageState::Running.can_transition_to(StageState::Skipped));
        assert!(!StageState::Succeeded.can_transition_to(StageState::Running));
        assert!(!StageState::Failed.can_transition_to(StageState::Running));
    }

    #[test]
    fn test_stage_state_serialize() {
        let json = serde_json::to_string(&StageState::NotAttempted).unwrap();
        assert_eq!(json, r#""not_attempted""#);

        let deserialized: StageState = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, StageState::NotAttempted);
    }

    #[test]
    fn test_run_status_serialize() {
        assert_eq!(serde_json::to_string(&RunStatus::Succeeded).unwrap(), r#""succeeded""#);
        assert_eq!(RunStatus::default(), RunStatus::Pending);
    }
}
