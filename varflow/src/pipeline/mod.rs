//! Pipeline definition and execution.
//!
//! This module provides:
//! - Stage and pipeline definitions
//! - The stage registry and order resolution
//! - Runner configuration and retry policy
//! - The sequential pipeline runner and its report
//! - The built-in variant-calling pipeline

mod config;
mod definition;
mod registry;
mod report;
mod retry;
mod runner;
pub mod variant_calling;

pub use config::{RunnerConfig, DEFAULT_THREADS, THREADS_PARAM};
pub use definition::{PipelineDefinition, PipelineInputs, StageDefinition};
pub use registry::StageRegistry;
pub use report::{PipelineRunReport, StageReport};
pub use retry::{BackoffStrategy, JitterStrategy, RetryDecision, RetryPolicy, RetryState};
pub use runner::{ExecutionPlan, PipelineRun, PipelineRunner};
pub use variant_calling::VariantCallingConfig;
