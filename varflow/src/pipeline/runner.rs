//! The pipeline runner.
//!
//! Stages run strictly one at a time in resolved order. For each stage
//! the runner decides, in this order:
//!
//! 1. skip it if every output is already complete (when resuming),
//! 2. fail it if a required input is missing,
//! 3. otherwise run its invocations in declared order, stopping at the
//!    first failure, and verify every output afterwards.
//!
//! The first failed stage halts the run; later stages are reported
//! `NotAttempted`. Cancellation marks the current stage and every later
//! stage `Aborted`.

use super::config::RunnerConfig;
use super::definition::{PipelineDefinition, PipelineInputs, StageDefinition};
use super::registry::StageRegistry;
use super::report::{PipelineRunReport, StageReport};
use super::retry::{RetryDecision, RetryState};
use crate::cancellation::CancellationToken;
use crate::core::{ArgPart, Artifact, Invocation, RunStatus, StageState};
use crate::errors::{
    ContractErrorInfo, DefinitionError, InvocationError, PipelineValidationError, StageFailure,
    VarflowError,
};
use crate::events::{event_types, EventSink, NoOpEventSink};
use crate::store::ArtifactStore;
use crate::tools::{InvocationRequest, OutputTarget, ProcessInvoker, ToolInvoker};
use crate::utils::{duration_ms, generate_run_id, now_utc, tail_excerpt};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One end-to-end execution attempt of a pipeline.
///
/// `completed` only grows: a stage is added once all of its outputs have
/// been confirmed present, and is never removed.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    run_id: Uuid,
    stages: Vec<String>,
    completed: BTreeSet<String>,
    status: RunStatus,
}

impl PipelineRun {
    /// Creates a pending run over the resolved stage order.
    #[must_use]
    pub fn new(run_id: Uuid, stages: Vec<String>) -> Self {
        Self {
            run_id,
            stages,
            completed: BTreeSet::new(),
            status: RunStatus::Pending,
        }
    }

    /// Returns the run identifier.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the resolved stage order.
    #[must_use]
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// Returns the stages whose outputs were verified present.
    #[must_use]
    pub fn completed(&self) -> &BTreeSet<String> {
        &self.completed
    }

    /// Returns true if the stage's outputs were verified present.
    #[must_use]
    pub fn is_completed(&self, stage: &str) -> bool {
        self.completed.contains(stage)
    }

    /// Returns the run status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Moves the run to `Running`.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
    }

    /// Records that a stage's outputs were verified. Returns false if the
    /// stage is not part of the run.
    pub fn mark_completed(&mut self, stage: &str) -> bool {
        if !self.stages.iter().any(|s| s == stage) {
            return false;
        }
        self.completed.insert(stage.to_string());
        true
    }

    /// Sets the final status: succeeded iff every stage completed.
    pub fn finish(&mut self) -> RunStatus {
        self.status = if self.completed.len() == self.stages.len() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        self.status
    }
}

/// A validated pipeline with its resolved stage order and parameters.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pipeline: String,
    registry: StageRegistry,
    order: Vec<String>,
    params: BTreeMap<String, String>,
}

impl ExecutionPlan {
    /// Returns the pipeline name.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Returns the stage names in execution order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Iterates over the stages in execution order.
    pub fn stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.order.iter().filter_map(|name| self.registry.get(name))
    }

    /// Returns the effective parameter values.
    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}

/// Why the remaining stages will not run.
enum Halt {
    Failed,
    Aborted(String),
}

/// Per-run state threaded through stage execution.
struct RunContext<'a> {
    run_id: Uuid,
    plan: &'a ExecutionPlan,
    inputs: &'a PipelineInputs,
    invocations: usize,
}

/// Executes pipeline definitions.
pub struct PipelineRunner {
    config: RunnerConfig,
    store: ArtifactStore,
    invoker: Arc<dyn ToolInvoker>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("config", &self.config)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl PipelineRunner {
    /// Creates a runner that launches real processes.
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        let store = ArtifactStore::new(&config.base_dir).with_completeness(config.completeness);
        let invoker = ProcessInvoker::new().with_stderr_limit(config.stderr_excerpt_limit);
        Self {
            config,
            store,
            invoker: Arc::new(invoker),
            events: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Replaces the tool invoker.
    #[must_use]
    pub fn with_invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Shares a cancellation token with the caller.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the token that aborts this runner's runs.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        self.cancel.clone()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Returns the artifact store.
    #[must_use]
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Validates a definition against the starting inputs and resolves
    /// the stage order. Touches nothing on disk.
    ///
    /// # Errors
    ///
    /// Returns a `DefinitionError` for invalid stages, cycles, unknown
    /// artifacts or parameters without a value.
    pub fn plan(
        &self,
        definition: &PipelineDefinition,
        inputs: &PipelineInputs,
    ) -> Result<ExecutionPlan, DefinitionError> {
        let registry = StageRegistry::from_definition(definition)?.with_supplied(inputs.ids());
        let order = registry.resolve_names()?;

        let mut params = definition.params.clone();
        params.extend(self.config.params.clone());

        for stage in registry.stages() {
            if let Some(missing) = stage
                .referenced_params()
                .into_iter()
                .find(|name| !params.contains_key(*name))
            {
                let message = format!("Stage '{}' uses parameter '{missing}', which has no value", stage.name);
                return Err(PipelineValidationError::new(message.clone())
                    .with_stages(vec![stage.name.clone()])
                    .with_error_info(
                        ContractErrorInfo::new("PIPELINE-UNKNOWN-PARAM", message)
                            .with_fix_hint("Set the parameter in the definition's params or the runner configuration.")
                            .with_context_entry("param", missing),
                    )
                    .into());
            }
        }

        Ok(ExecutionPlan {
            pipeline: definition.name.clone(),
            registry,
            order,
            params,
        })
    }

    /// Runs a pipeline to completion.
    ///
    /// Definition problems are returned as errors before anything is
    /// created on disk. Every runtime failure is recorded in the report.
    ///
    /// # Errors
    ///
    /// Returns `VarflowError::Definition` if the definition is invalid and
    /// `VarflowError::Storage` if the base output directory cannot be created.
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        inputs: &PipelineInputs,
    ) -> Result<PipelineRunReport, VarflowError> {
        let plan = self.plan(definition, inputs)?;
        self.store.ensure_base_dir()?;
        Ok(self.execute(&plan, inputs).await)
    }

    /// Runs an already validated plan.
    pub async fn execute(&self, plan: &ExecutionPlan, inputs: &PipelineInputs) -> PipelineRunReport {
        let started = Instant::now();
        let started_at = now_utc();
        let mut run = PipelineRun::new(generate_run_id(), plan.order.clone());
        let mut ctx = RunContext {
            run_id: run.run_id(),
            plan,
            inputs,
            invocations: 0,
        };

        info!(
            run_id = %ctx.run_id,
            pipeline = %plan.pipeline,
            stages = ?plan.order,
            base_dir = %self.store.base_dir().display(),
            "Pipeline run started"
        );
        self.emit(
            event_types::PIPELINE_STARTED,
            json!({"run_id": ctx.run_id, "pipeline": plan.pipeline, "stages": plan.order}),
        );
        run.start();

        let mut reports = Vec::with_capacity(plan.order.len());
        let mut halt: Option<Halt> = None;
        let mut first_failed_stage = None;

        for stage in plan.stages() {
            if halt.is_none() && self.cancel.is_cancelled() {
                halt = Some(Halt::Aborted(self.cancel.reason_or_default()));
            }

            let report = match &halt {
                Some(Halt::Failed) => {
                    let mut report = StageReport::pending(&stage.name);
                    report.state = StageState::NotAttempted;
                    report
                }
                Some(Halt::Aborted(reason)) => self.aborted_report(&ctx, &stage.name, reason),
                None => self.process_stage(stage, &mut ctx).await,
            };

            match report.state {
                StageState::Succeeded | StageState::Skipped => {
                    run.mark_completed(&stage.name);
                }
                StageState::Failed if halt.is_none() => {
                    first_failed_stage = Some(stage.name.clone());
                    halt = Some(Halt::Failed);
                }
                StageState::Aborted if halt.is_none() => {
                    halt = Some(Halt::Aborted(self.cancel.reason_or_default()));
                }
                _ => {}
            }
            reports.push(report);
        }

        let status = run.finish();
        let abort_reason = match halt {
            Some(Halt::Aborted(reason)) => Some(reason),
            _ => None,
        };
        let report = PipelineRunReport {
            run_id: ctx.run_id,
            pipeline: plan.pipeline.clone(),
            started_at,
            status,
            first_failed_stage,
            abort_reason,
            stages: reports,
            duration_ms: duration_ms(started.elapsed()),
            invocations_executed: ctx.invocations,
        };

        self.emit(
            event_types::PIPELINE_COMPLETED,
            json!({
                "run_id": ctx.run_id,
                "status": report.status,
                "first_failed_stage": report.first_failed_stage,
                "abort_reason": report.abort_reason,
                "duration_ms": report.duration_ms,
            }),
        );
        match report.status {
            RunStatus::Succeeded => info!(
                run_id = %ctx.run_id,
                duration_ms = report.duration_ms,
                invocations = report.invocations_executed,
                "Pipeline run succeeded"
            ),
            _ => error!(
                run_id = %ctx.run_id,
                first_failed_stage = ?report.first_failed_stage,
                abort_reason = ?report.abort_reason,
                "Pipeline run failed"
            ),
        }
        report
    }

    async fn process_stage(&self, stage: &StageDefinition, ctx: &mut RunContext<'_>) -> StageReport {
        let started = Instant::now();
        let mut report = StageReport::pending(&stage.name);

        if self.config.resume && stage.outputs.iter().all(|artifact| self.store.is_complete(artifact)) {
            info!(stage = %stage.name, "All outputs present, skipping stage");
            report.state = StageState::Skipped;
            self.emit(
                event_types::STAGE_SKIPPED,
                json!({"run_id": ctx.run_id, "stage": stage.name, "reason": "outputs_present"}),
            );
            return report;
        }

        if let Some(failure) = self.missing_input(stage, ctx) {
            report.duration_ms = duration_ms(started.elapsed());
            return self.fail(ctx, report, failure);
        }

        info!(stage = %stage.name, invocations = stage.invocations.len(), "Stage started");
        report.state = StageState::Running;
        self.emit(
            event_types::STAGE_STARTED,
            json!({"run_id": ctx.run_id, "stage": stage.name}),
        );

        let policy = &self.config.retry;
        let mut retry = RetryState::new();
        let outcome = loop {
            let attempt = retry.begin_attempt();
            debug!(stage = %stage.name, attempt, "Attempting stage");

            let failure = match self.attempt_stage(stage, ctx, &mut report).await {
                Ok(()) => break Ok(()),
                Err(failure) => failure,
            };
            if failure.is_abort() {
                break Err(failure);
            }

            match retry.decide(&failure, policy) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        stage = %stage.name,
                        attempt,
                        delay_ms = duration_ms(delay),
                        error = %failure,
                        "Stage failed, retrying"
                    );
                    self.emit(
                        event_types::STAGE_RETRYING,
                        json!({
                            "run_id": ctx.run_id,
                            "stage": stage.name,
                            "attempt": attempt,
                            "delay_ms": duration_ms(delay),
                            "failure": failure,
                        }),
                    );
                    if !self.backoff(delay).await {
                        break Err(StageFailure::Aborted {
                            reason: self.cancel.reason_or_default(),
                        });
                    }
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => break Err(failure),
            }
        };

        report.attempts = retry.attempts();
        report.duration_ms = duration_ms(started.elapsed());

        match outcome {
            Ok(()) => {
                report.state = StageState::Succeeded;
                info!(stage = %stage.name, duration_ms = report.duration_ms, "Stage succeeded");
                self.emit(
                    event_types::STAGE_SUCCEEDED,
                    json!({
                        "run_id": ctx.run_id,
                        "stage": stage.name,
                        "duration_ms": report.duration_ms,
                        "exit_codes": report.exit_codes,
                    }),
                );
                report
            }
            Err(StageFailure::Aborted { reason }) => {
                let mut aborted = self.aborted_report(ctx, &stage.name, &reason);
                aborted.exit_codes = report.exit_codes;
                aborted.duration_ms = report.duration_ms;
                aborted.attempts = report.attempts;
                aborted
            }
            Err(failure) => self.fail(ctx, report, failure),
        }
    }

    /// Runs every invocation of the stage once and moves its outputs into place.
    async fn attempt_stage(
        &self,
        stage: &StageDefinition,
        ctx: &mut RunContext<'_>,
        report: &mut StageReport,
    ) -> Result<(), StageFailure> {
        report.exit_codes.clear();
        report.stderr_excerpt = None;

        let targets = self.prepare_outputs(stage)?;

        for invocation in &stage.invocations {
            if self.cancel.is_cancelled() {
                return Err(StageFailure::Aborted {
                    reason: self.cancel.reason_or_default(),
                });
            }

            let request = self.build_request(stage, invocation, &targets, ctx)?;
            debug!(stage = %stage.name, command = %request.command_line(), "Invoking tool");
            self.emit(
                event_types::INVOCATION_STARTED,
                json!({
                    "run_id": ctx.run_id,
                    "stage": stage.name,
                    "program": request.program,
                    "args": request.args,
                }),
            );
            ctx.invocations += 1;

            let result = match self.invoker.invoke(&request, &self.cancel).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(stage = %stage.name, program = %request.program, error = %err, "Invocation failed");
                    if let InvocationError::Timeout { stderr, .. } = &err {
                        if !stderr.is_empty() {
                            report.stderr_excerpt =
                                Some(tail_excerpt(stderr, self.config.stderr_excerpt_limit));
                        }
                    }
                    return Err(err.into());
                }
            };

            report.exit_codes.push(result.exit_code);
            self.emit(
                event_types::INVOCATION_COMPLETED,
                json!({
                    "run_id": ctx.run_id,
                    "stage": stage.name,
                    "program": request.program,
                    "exit_code": result.exit_code,
                    "duration_ms": duration_ms(result.duration),
                }),
            );

            if !result.success() {
                if !result.stderr.is_empty() {
                    report.stderr_excerpt =
                        Some(tail_excerpt(&result.stderr, self.config.stderr_excerpt_limit));
                }
                return Err(StageFailure::Execution {
                    program: request.program,
                    exit_code: result.exit_code,
                });
            }
        }

        self.finalize_outputs(stage, &targets)
    }

    /// Resolves where each output is written during the attempt and makes
    /// those locations ready.
    fn prepare_outputs(&self, stage: &StageDefinition) -> Result<BTreeMap<String, PathBuf>, StageFailure> {
        if self.config.atomic_outputs {
            self.store.clear_staging(&stage.name)?;
        }

        let mut targets = BTreeMap::new();
        for artifact in &stage.outputs {
            let path = if self.config.atomic_outputs {
                self.store.staging_path(&stage.name, artifact)
            } else {
                self.store.resolve(artifact)
            };
            self.store.prepare_output(&path, artifact.kind)?;
            targets.insert(artifact.id.clone(), path);
        }
        Ok(targets)
    }

    /// Checks every output after all invocations succeeded, committing
    /// staged outputs first when atomic production is enabled.
    fn finalize_outputs(
        &self,
        stage: &StageDefinition,
        targets: &BTreeMap<String, PathBuf>,
    ) -> Result<(), StageFailure> {
        if self.config.atomic_outputs {
            for artifact in &stage.outputs {
                let complete = targets
                    .get(&artifact.id)
                    .is_some_and(|staged| self.store.is_complete_at(staged, artifact.kind));
                if !complete {
                    return Err(self.missing_output(artifact));
                }
            }
            for artifact in &stage.outputs {
                if let Some(staged) = targets.get(&artifact.id) {
                    self.store.commit(staged, artifact)?;
                }
            }
            self.store.release_staging(&stage.name);
        }

        match stage.outputs.iter().find(|artifact| !self.store.is_complete(artifact)) {
            Some(artifact) => Err(self.missing_output(artifact)),
            None => Ok(()),
        }
    }

    fn build_request(
        &self,
        stage: &StageDefinition,
        invocation: &Invocation,
        targets: &BTreeMap<String, PathBuf>,
        ctx: &RunContext<'_>,
    ) -> Result<InvocationRequest, StageFailure> {
        let mut args = Vec::with_capacity(invocation.args.len());
        for template in &invocation.args {
            let rendered = template
                .render(|part| self.resolve_part(part, targets, ctx))
                .map_err(|part| unresolved(stage, &part))?;
            args.push(rendered);
        }

        let program = self.config.program_for(&invocation.program);
        let mut request = InvocationRequest::new(program).with_args(args);

        if let Some(id) = &invocation.stdout {
            let path = targets
                .get(id)
                .ok_or_else(|| unresolved(stage, &ArgPart::Output(id.clone())))?;
            request = request.with_stdout(path);
        }
        if let Some(timeout) = invocation.timeout().or_else(|| self.config.invocation_timeout()) {
            request = request.with_timeout(timeout);
        }

        let mut written = BTreeSet::new();
        for id in invocation.referenced_outputs() {
            if !written.insert(id) {
                continue;
            }
            if let (Some(artifact), Some(path)) = (stage.output_artifact(id), targets.get(id)) {
                request = request.with_output(OutputTarget {
                    artifact: id.to_string(),
                    path: path.clone(),
                    kind: artifact.kind,
                });
            }
        }

        Ok(request)
    }

    fn resolve_part(
        &self,
        part: &ArgPart,
        targets: &BTreeMap<String, PathBuf>,
        ctx: &RunContext<'_>,
    ) -> Option<String> {
        match part {
            ArgPart::Literal(text) => Some(text.clone()),
            ArgPart::Input(id) => self
                .input_artifact(id, ctx)
                .map(|artifact| self.store.resolve(artifact).to_string_lossy().into_owned()),
            ArgPart::Output(id) => targets.get(id).map(|path| path.to_string_lossy().into_owned()),
            ArgPart::Param(name) => ctx.plan.params.get(name).cloned(),
        }
    }

    fn input_artifact<'a>(&self, id: &str, ctx: &'a RunContext<'_>) -> Option<&'a Artifact> {
        ctx.plan
            .registry
            .output_artifact(id)
            .or_else(|| ctx.inputs.get(id))
    }

    fn missing_input(&self, stage: &StageDefinition, ctx: &RunContext<'_>) -> Option<StageFailure> {
        stage.inputs.iter().find_map(|id| match self.input_artifact(id, ctx) {
            Some(artifact) if self.store.exists(artifact) => None,
            Some(artifact) => Some(StageFailure::MissingInput {
                artifact: id.clone(),
                path: self.store.resolve(artifact),
            }),
            None => Some(StageFailure::MissingInput {
                artifact: id.clone(),
                path: PathBuf::new(),
            }),
        })
    }

    fn missing_output(&self, artifact: &Artifact) -> StageFailure {
        StageFailure::MissingOutput {
            artifact: artifact.id.clone(),
            path: self.store.resolve(artifact),
        }
    }

    fn fail(&self, ctx: &RunContext<'_>, mut report: StageReport, failure: StageFailure) -> StageReport {
        error!(
            stage = %report.stage_name,
            error = %failure,
            exit_codes = ?report.exit_codes,
            "Stage failed"
        );
        if let Some(excerpt) = &report.stderr_excerpt {
            error!(stage = %report.stage_name, "stderr:\n{excerpt}");
        }
        self.emit(
            event_types::STAGE_FAILED,
            json!({
                "run_id": ctx.run_id,
                "stage": report.stage_name,
                "failure": failure,
                "exit_codes": report.exit_codes,
                "duration_ms": report.duration_ms,
            }),
        );
        report.state = StageState::Failed;
        report.failure = Some(failure);
        report
    }

    fn aborted_report(&self, ctx: &RunContext<'_>, stage: &str, reason: &str) -> StageReport {
        warn!(stage = %stage, reason = %reason, "Stage aborted");
        self.emit(
            event_types::STAGE_ABORTED,
            json!({"run_id": ctx.run_id, "stage": stage, "reason": reason}),
        );
        let mut report = StageReport::pending(stage);
        report.state = StageState::Aborted;
        report.failure = Some(StageFailure::Aborted {
            reason: reason.to_string(),
        });
        report
    }

    /// Sleeps before a retry. Returns false if the run was cancelled meanwhile.
    async fn backoff(&self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => !self.cancel.is_cancelled(),
            () = self.cancel.cancelled() => false,
        }
    }

    fn emit(&self, event_type: &str, data: serde_json::Value) {
        self.events.try_emit(event_type, Some(data));
    }
}

fn unresolved(stage: &StageDefinition, part: &ArgPart) -> StageFailure {
    let placeholder = match part {
        ArgPart::Input(id) => format!("{{in:{id}}}"),
        ArgPart::Output(id) => format!("{{out:{id}}}"),
        ArgPart::Param(name) => format!("{{param:{name}}}"),
        ArgPart::Literal(text) => text.clone(),
    };
    StageFailure::Storage {
        message: format!("Stage '{}' has an unresolvable placeholder {placeholder}", stage.name),
    }
}
