//! Testing utilities for varflow pipelines.
//!
//! This module provides:
//! - A scripted tool invoker that never launches processes
//! - Assertions over run reports

mod assertions;
mod mocks;

pub use assertions::{
    assert_run_failed_at, assert_run_succeeded, assert_stage_state, assert_stage_states,
};
pub use mocks::{ScriptedInvoker, ToolBehavior, DIRECTORY_MARKER};
