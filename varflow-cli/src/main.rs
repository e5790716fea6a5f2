mod args;

use anyhow::{Context, Result};
use args::Arguments;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use varflow::errors::{StageFailure, VarflowError};
use varflow::events::LoggingEventSink;
use varflow::pipeline::{PipelineRunReport, PipelineRunner};
use varflow::tools::resolve_program;

const EXIT_SUCCESS: u8 = 0;
const EXIT_INTERNAL: u8 = 1;
const EXIT_PRECONDITION: u8 = 2;
const EXIT_EXECUTION: u8 = 3;
const EXIT_TIMEOUT: u8 = 4;
const EXIT_ABORTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Arguments::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_INTERNAL } else { EXIT_SUCCESS };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    init_tracing(args.verbose, args.json_logs);

    match run(&args).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

/// Installs the tracing subscriber. `RUST_LOG` wins unless `-v` is given.
fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

async fn run(args: &Arguments) -> Result<u8> {
    let (definition, inputs, config) = args.plan()?;

    if args.check_tools {
        let missing: Vec<&str> = definition
            .programs()
            .into_iter()
            .map(|program| config.program_for(program))
            .filter(|program| resolve_program(program).is_none())
            .collect();
        if !missing.is_empty() {
            for program in &missing {
                error!(program = %program, "Tool not found on PATH");
            }
            return Ok(EXIT_PRECONDITION);
        }
        info!(tools = ?definition.programs(), "All tools found");
    }

    let runner = PipelineRunner::new(config).with_event_sink(Arc::new(LoggingEventSink::debug()));

    if args.dry_run {
        return match runner.plan(&definition, &inputs) {
            Ok(plan) => {
                let summary = serde_json::json!({
                    "pipeline": plan.pipeline(),
                    "order": plan.order(),
                    "params": plan.params(),
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok(EXIT_SUCCESS)
            }
            Err(err) => {
                log_definition_error(&err);
                Ok(EXIT_PRECONDITION)
            }
        };
    }

    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel("interrupted by operator");
        }
    });

    let report = match runner.run(&definition, &inputs).await {
        Ok(report) => report,
        Err(VarflowError::Definition(err)) => {
            log_definition_error(&err);
            return Ok(EXIT_PRECONDITION);
        }
        Err(VarflowError::Storage(err)) => {
            error!(error = %err, "Output directory is not usable");
            return Ok(EXIT_PRECONDITION);
        }
        Err(err) => return Err(err.into()),
    };

    summarize(&report);

    let path = args.report_path();
    report
        .write_json(&path)
        .with_context(|| format!("Failed to write run report to {}", path.display()))?;
    info!(path = %path.display(), "Run report written");

    Ok(exit_code(&report))
}

fn log_definition_error(err: &varflow::errors::DefinitionError) {
    match err.error_info() {
        Some(info) => error!(
            code = %info.code,
            stages = ?err.stages(),
            hint = info.fix_hint.as_deref().unwrap_or(""),
            "Invalid pipeline definition: {err}"
        ),
        None => error!("Invalid pipeline definition: {err}"),
    }
}

fn summarize(report: &PipelineRunReport) {
    for stage in &report.stages {
        info!(
            stage = %stage.stage_name,
            state = %stage.state,
            duration_ms = stage.duration_ms,
            exit_codes = ?stage.exit_codes,
            "Stage summary"
        );
        if let Some(excerpt) = &stage.stderr_excerpt {
            debug!(stage = %stage.stage_name, "stderr:\n{excerpt}");
        }
    }
    if report.succeeded() {
        info!(
            run_id = %report.run_id,
            duration_ms = report.duration_ms,
            "Variant calling pipeline completed successfully"
        );
    } else if let Some(reason) = &report.abort_reason {
        warn!(run_id = %report.run_id, reason = %reason, "Pipeline aborted");
    } else if let Some(failure) = report.decisive_failure() {
        error!(
            run_id = %report.run_id,
            stage = ?report.first_failed_stage,
            "Pipeline failed: {failure}"
        );
    }
}

/// Maps a finished run to the process exit code.
fn exit_code(report: &PipelineRunReport) -> u8 {
    if report.succeeded() {
        return EXIT_SUCCESS;
    }
    if report.was_aborted() {
        return EXIT_ABORTED;
    }
    match report.decisive_failure() {
        Some(
            StageFailure::Launch { .. } | StageFailure::Storage { .. } | StageFailure::MissingInput { .. },
        ) => EXIT_PRECONDITION,
        Some(StageFailure::Execution { .. } | StageFailure::MissingOutput { .. }) => EXIT_EXECUTION,
        Some(StageFailure::Timeout { .. }) => EXIT_TIMEOUT,
        Some(StageFailure::Aborted { .. }) => EXIT_ABORTED,
        None => EXIT_INTERNAL,
    }
}
