//! # Varflow
//!
//! A resumable orchestration engine for pipelines built from external
//! command-line tools, with a built-in paired-end variant-calling
//! pipeline (quality control, alignment, sort and index, variant calling).
//!
//! Varflow provides:
//!
//! - **Declarative stages**: each stage names the artifacts it consumes and
//!   produces; execution order is derived from those declarations
//! - **Resumable runs**: stages whose outputs already exist are skipped
//! - **Atomic outputs**: outputs are staged and moved into place only after
//!   every invocation of the stage succeeded
//! - **Fail-fast reporting**: the first failing stage halts the run and the
//!   report records exit codes and a stderr excerpt
//! - **Cancellation**: an interrupt kills the running tool and marks the
//!   remaining stages aborted
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use varflow::prelude::*;
//!
//! let config = VariantCallingConfig::new(
//!     "data/sample.R1.fq.gz",
//!     "data/sample.R2.fq.gz",
//!     "data/MN908947.3.fasta",
//!     "out",
//! );
//!
//! let runner = PipelineRunner::new(config.runner_config());
//! let report = runner.run(&config.definition(), &config.inputs()).await?;
//! report.write_json("out/run_report.json")?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod core;
pub mod errors;
pub mod events;
pub mod pipeline;
pub mod store;
pub mod testing;
pub mod tools;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::core::{Artifact, ArtifactKind, Invocation, RunStatus, StageState};
    pub use crate::errors::{
        ContractErrorInfo, CycleDetectedError, DefinitionError, InvocationError,
        PipelineValidationError, StageFailure, StorageError, UnknownArtifactError, VarflowError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        PipelineDefinition, PipelineInputs, PipelineRunReport, PipelineRunner, RetryPolicy,
        RunnerConfig, StageDefinition, StageRegistry, StageReport, VariantCallingConfig,
    };
    pub use crate::store::{ArtifactStore, CompletenessCheck};
    pub use crate::tools::{InvocationRequest, InvocationResult, ProcessInvoker, ToolInvoker};
    pub use crate::utils::{generate_run_id, iso_timestamp, Timestamp};
}
