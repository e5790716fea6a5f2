//! Command-line arguments.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use varflow::pipeline::{
    PipelineDefinition, PipelineInputs, RetryPolicy, RunnerConfig, VariantCallingConfig,
};
use varflow::store::CompletenessCheck;

/// Runs the paired-end variant-calling pipeline, or a pipeline loaded from JSON.
#[derive(Parser, Debug, Clone)]
#[command(name = "varflow", version, about)]
pub struct Arguments {
    /// Forward reads (FASTQ).
    #[arg(short = 'i', long = "file1", required_unless_present = "pipeline")]
    pub reads_r1: Option<PathBuf>,

    /// Reverse reads (FASTQ).
    #[arg(short = 'I', long = "file2", required_unless_present = "pipeline")]
    pub reads_r2: Option<PathBuf>,

    /// Reference genome (FASTA).
    #[arg(short = 'r', long = "reference", required_unless_present = "pipeline")]
    pub reference: Option<PathBuf>,

    /// Base output directory for every generated file.
    #[arg(short = 'o', long = "out", default_value = "out")]
    pub out_dir: PathBuf,

    /// Thread hint passed to tools.
    #[arg(short = 't', long, default_value_t = varflow::pipeline::DEFAULT_THREADS)]
    pub threads: usize,

    /// Run a pipeline definition from a JSON file instead of the built-in one.
    #[arg(long, value_name = "FILE")]
    pub pipeline: Option<PathBuf>,

    /// Starting input for a custom pipeline, as ID=PATH. Repeatable.
    #[arg(long = "input", value_name = "ID=PATH", value_parser = parse_key_val, requires = "pipeline")]
    pub inputs: Vec<(String, String)>,

    /// Program substitution, as NAME=PATH. Repeatable.
    #[arg(long = "tool", value_name = "NAME=PATH", value_parser = parse_key_val)]
    pub tools: Vec<(String, String)>,

    /// Where to write the JSON run report. Defaults to <out>/run_report.json.
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Run every stage even if its outputs already exist.
    #[arg(long)]
    pub no_resume: bool,

    /// Treat empty output files and directories as missing.
    #[arg(long)]
    pub non_empty: bool,

    /// Write outputs directly to their final paths instead of staging them.
    #[arg(long)]
    pub direct_outputs: bool,

    /// Time limit in seconds for each tool invocation.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Attempts per stage for non-zero exits and timeouts.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,

    /// Verify every tool is installed before running.
    #[arg(long)]
    pub check_tools: bool,

    /// Print the resolved stage order and exit.
    #[arg(long)]
    pub dry_run: bool,

    /// Log at debug level.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

impl Arguments {
    /// Returns the report path.
    pub fn report_path(&self) -> PathBuf {
        self.report
            .clone()
            .unwrap_or_else(|| self.out_dir.join("run_report.json"))
    }

    /// Builds the definition, starting inputs and runner configuration.
    pub fn plan(&self) -> Result<(PipelineDefinition, PipelineInputs, RunnerConfig)> {
        let (definition, inputs, config) = match &self.pipeline {
            Some(path) => {
                let definition = PipelineDefinition::from_json_file(path)
                    .with_context(|| format!("Failed to load pipeline definition from {}", path.display()))?;
                let inputs = self.inputs.iter().fold(PipelineInputs::new(), |inputs, (id, path)| {
                    let path = PathBuf::from(path);
                    if path.is_dir() {
                        inputs.directory(id, path)
                    } else {
                        inputs.file(id, path)
                    }
                });
                let config = RunnerConfig::new(&self.out_dir).with_threads(self.threads);
                (definition, inputs, config)
            }
            None => {
                let builtin = VariantCallingConfig::new(
                    self.reads_r1.clone().context("--file1 is required")?,
                    self.reads_r2.clone().context("--file2 is required")?,
                    self.reference.clone().context("--reference is required")?,
                    &self.out_dir,
                )
                .with_threads(self.threads);
                (builtin.definition(), builtin.inputs(), builtin.runner_config())
            }
        };

        Ok((definition, inputs, self.apply(config)))
    }

    fn apply(&self, config: RunnerConfig) -> RunnerConfig {
        let mut config = config
            .with_resume(!self.no_resume)
            .with_atomic_outputs(!self.direct_outputs)
            .with_retry(RetryPolicy::default().with_max_attempts(self.max_attempts));
        if self.non_empty {
            config = config.with_completeness(CompletenessCheck::NonEmpty);
        }
        if let Some(secs) = self.timeout {
            config = config.with_invocation_timeout(Duration::from_secs(secs));
        }
        self.tools
            .iter()
            .fold(config, |config, (program, path)| config.with_tool_override(program, path))
    }
}

/// Parses `KEY=VALUE`.
fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() && !value.is_empty() => {
            Ok((key.to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("bwa=/opt/bwa/bwa").unwrap(),
            ("bwa".to_string(), "/opt/bwa/bwa".to_string())
        );
        assert!(parse_key_val("bwa").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_builtin_pipeline_arguments() {
        let args = Arguments::try_parse_from([
            "varflow", "-i", "r1.fq", "-I", "r2.fq", "-r", "ref.fasta", "-o", "results", "-t", "8",
            "--no-resume", "--tool", "bwa=/opt/bwa", "--timeout", "600",
        ])
        .unwrap();

        let (definition, inputs, config) = args.plan().unwrap();

        assert_eq!(definition.name, "variant-calling");
        assert_eq!(inputs.len(), 3);
        assert!(!config.resume);
        assert_eq!(config.base_dir, PathBuf::from("results"));
        assert_eq!(config.params.get("threads").map(String::as_str), Some("8"));
        assert_eq!(config.program_for("bwa"), "/opt/bwa");
        assert_eq!(config.invocation_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(args.report_path(), PathBuf::from("results/run_report.json"));
    }

    #[test]
    fn test_reads_required_without_pipeline() {
        assert!(Arguments::try_parse_from(["varflow", "-r", "ref.fasta"]).is_err());
    }

    #[test]
    fn test_inputs_require_pipeline() {
        assert!(Arguments::try_parse_from([
            "varflow", "-i", "a", "-I", "b", "-r", "c", "--input", "x=y"
        ])
        .is_err());
    }

    #[test]
    fn test_custom_pipeline_arguments() {
        let args = Arguments::try_parse_from([
            "varflow",
            "--pipeline",
            "pipeline.json",
            "--input",
            "reads=data/reads.fq",
            "--max-attempts",
            "3",
            "--non-empty",
        ])
        .unwrap();

        assert_eq!(args.inputs, vec![("reads".to_string(), "data/reads.fq".to_string())]);
        assert_eq!(args.max_attempts, 3);
        assert!(args.non_empty);
        assert!(args.reads_r1.is_none());
    }
}
