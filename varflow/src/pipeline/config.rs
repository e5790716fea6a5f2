//! Runner configuration.

use super::retry::RetryPolicy;
use crate::store::CompletenessCheck;
use crate::tools::DEFAULT_STDERR_LIMIT;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Parameter name for the parallelism hint passed to tools.
pub const THREADS_PARAM: &str = "threads";

/// Default value of the `threads` parameter.
pub const DEFAULT_THREADS: usize = 4;

/// Settings for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Base output directory; relative produced artifacts resolve under it.
    pub base_dir: PathBuf,
    /// Skip stages whose outputs already exist.
    pub resume: bool,
    /// Write outputs to a staging area and move them into place on success.
    pub atomic_outputs: bool,
    /// How existing outputs are judged complete.
    pub completeness: CompletenessCheck,
    /// Time limit for each invocation that does not set its own.
    pub invocation_timeout_secs: Option<u64>,
    /// Stage retry policy.
    pub retry: RetryPolicy,
    /// Characters of stderr kept per failed stage in the report.
    pub stderr_excerpt_limit: usize,
    /// Values for `{param:...}` placeholders; these override definition defaults.
    pub params: BTreeMap<String, String>,
    /// Program substitutions, e.g. `bwa` -> `/opt/bwa-0.7.17/bwa`.
    pub tool_overrides: BTreeMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let mut params = BTreeMap::new();
        params.insert(THREADS_PARAM.to_string(), DEFAULT_THREADS.to_string());

        Self {
            base_dir: PathBuf::from("."),
            resume: true,
            atomic_outputs: true,
            completeness: CompletenessCheck::Presence,
            invocation_timeout_secs: None,
            retry: RetryPolicy::none(),
            stderr_excerpt_limit: DEFAULT_STDERR_LIMIT,
            params,
            tool_overrides: BTreeMap::new(),
        }
    }
}

impl RunnerConfig {
    /// Creates a configuration writing under `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Enables or disables skipping of already-complete stages.
    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Enables or disables staged, atomic output production.
    #[must_use]
    pub fn with_atomic_outputs(mut self, atomic: bool) -> Self {
        self.atomic_outputs = atomic;
        self
    }

    /// Sets the completeness check.
    #[must_use]
    pub fn with_completeness(mut self, completeness: CompletenessCheck) -> Self {
        self.completeness = completeness;
        self
    }

    /// Sets the default invocation timeout.
    #[must_use]
    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets how much stderr is kept per failed stage.
    #[must_use]
    pub fn with_stderr_excerpt_limit(mut self, limit: usize) -> Self {
        self.stderr_excerpt_limit = limit;
        self
    }

    /// Sets a parameter value.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Sets the `threads` parameter.
    #[must_use]
    pub fn with_threads(self, threads: usize) -> Self {
        self.with_param(THREADS_PARAM, threads.max(1).to_string())
    }

    /// Substitutes `program` with `replacement` at invocation time.
    #[must_use]
    pub fn with_tool_override(mut self, program: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.tool_overrides.insert(program.into(), replacement.into());
        self
    }

    /// Returns the default invocation timeout.
    #[must_use]
    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout_secs.map(Duration::from_secs)
    }

    /// Returns the program actually launched for `program`.
    #[must_use]
    pub fn program_for<'a>(&'a self, program: &'a str) -> &'a str {
        self.tool_overrides
            .get(program)
            .map_or(program, String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert!(config.resume);
        assert!(config.atomic_outputs);
        assert_eq!(config.completeness, CompletenessCheck::Presence);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.params.get(THREADS_PARAM).map(String::as_str), Some("4"));
        assert!(config.invocation_timeout().is_none());
    }

    #[test]
    fn test_builder() {
        let config = RunnerConfig::new("/data/out")
            .with_resume(false)
            .with_threads(8)
            .with_invocation_timeout(Duration::from_secs(3600))
            .with_tool_override("bwa", "/opt/bwa/bwa");

        assert_eq!(config.base_dir, PathBuf::from("/data/out"));
        assert!(!config.resume);
        assert_eq!(config.params.get(THREADS_PARAM).map(String::as_str), Some("8"));
        assert_eq!(config.invocation_timeout(), Some(Duration::from_secs(3600)));
        assert_eq!(config.program_for("bwa"), "/opt/bwa/bwa");
        assert_eq!(config.program_for("samtools"), "samtools");
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: RunnerConfig =
            serde_json::from_str(r#"{"base_dir": "out", "completeness": "non_empty"}"#).unwrap();

        assert_eq!(config.completeness, CompletenessCheck::NonEmpty);
        assert!(config.resume);
        assert_eq!(config.retry, RetryPolicy::none());
    }
}
