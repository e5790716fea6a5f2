//! Artifact storage.
//!
//! This module provides:
//! - The artifact store (path resolution, existence and completeness checks)
//! - Staging and commit of outputs for atomic production
//! - Deterministic derived-path transforms

mod artifact_store;
mod paths;

pub use artifact_store::{staged_name, ArtifactStore, CompletenessCheck, STAGING_DIR};
pub use paths::{derived_path, PathTransform};
