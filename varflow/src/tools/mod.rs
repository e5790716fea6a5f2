//! External tool execution.
//!
//! This module provides:
//! - The [`ToolInvoker`] trait the runner executes commands through
//! - [`ProcessInvoker`], which runs real child processes
//! - Executable lookup for preflight checks

mod invoker;
mod process;
mod resolve;

pub use invoker::{InvocationRequest, InvocationResult, OutputTarget, ToolInvoker};
pub use process::{ProcessInvoker, DEFAULT_STDERR_LIMIT};
pub use resolve::{resolve_program, resolve_program_in};
