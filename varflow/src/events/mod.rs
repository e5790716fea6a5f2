//! Run lifecycle events.
//!
//! The runner reports progress through an [`EventSink`]. Payloads are
//! JSON objects that always carry the `run_id`, and a `stage` field for
//! stage-scoped events.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Names of the events emitted by the pipeline runner.
pub mod event_types {
    /// A run began; carries the resolved stage order.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// A run finished; carries the overall status.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A stage's outputs already existed.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage began executing.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage is about to be re-run after a retryable failure.
    pub const STAGE_RETRYING: &str = "stage.retrying";
    /// A stage completed and its outputs were verified.
    pub const STAGE_SUCCEEDED: &str = "stage.succeeded";
    /// A stage failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage was aborted by the operator.
    pub const STAGE_ABORTED: &str = "stage.aborted";
    /// An external program is about to be launched.
    pub const INVOCATION_STARTED: &str = "invocation.started";
    /// An external program exited.
    pub const INVOCATION_COMPLETED: &str = "invocation.completed";
}
