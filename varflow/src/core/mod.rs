//! Core domain model types for varflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Artifact references and kinds
//! - Invocation descriptors and argument templates
//! - Stage state and run status enums

mod artifact;
mod invocation;
mod status;

pub use artifact::{Artifact, ArtifactKind};
pub use invocation::{ArgPart, ArgTemplate, Invocation};
pub use status::{RunStatus, StageState};
