//! Artifact references tracked as pipeline inputs and outputs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Whether an artifact is a plain file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A regular file.
    #[default]
    File,
    /// A directory.
    Directory,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

/// A reference to a file or directory on durable storage.
///
/// Artifacts are declared when the pipeline is defined. The filesystem
/// object appears only once the producing stage succeeds, and the
/// orchestrator never deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Identifier used by stages to reference the artifact.
    pub id: String,

    /// Logical location. Relative paths of produced artifacts resolve
    /// under the base output directory.
    pub path: PathBuf,

    /// File or directory.
    #[serde(default)]
    pub kind: ArtifactKind,

    /// Name of the stage that creates the artifact, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produced_by: Option<String>,
}

impl Artifact {
    /// Creates a file artifact.
    #[must_use]
    pub fn file(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            kind: ArtifactKind::File,
            produced_by: None,
        }
    }

    /// Creates a directory artifact.
    #[must_use]
    pub fn directory(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            kind: ArtifactKind::Directory,
            produced_by: None,
        }
    }

    /// Records the producing stage.
    #[must_use]
    pub fn with_producer(mut self, stage: impl Into<String>) -> Self {
        self.produced_by = Some(stage.into());
        self
    }

    /// Returns the logical path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the artifact is produced by a stage rather than supplied.
    #[must_use]
    pub fn is_produced(&self) -> bool {
        self.produced_by.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_constructors() {
        let bam = Artifact::file("aligned_bam", "aligned.bam");
        assert_eq!(bam.kind, ArtifactKind::File);
        assert!(!bam.is_produced());

        let report = Artifact::directory("quality_report", "quality").with_producer("quality-check");
        assert_eq!(report.kind, ArtifactKind::Directory);
        assert_eq!(report.produced_by.as_deref(), Some("quality-check"));
    }

    #[test]
    fn test_artifact_kind_defaults_to_file() {
        let artifact: Artifact =
            serde_json::from_str(r#"{"id": "vcf", "path": "variants.vcf"}"#).unwrap();
        assert_eq!(artifact.kind, ArtifactKind::File);
        assert!(artifact.produced_by.is_none());
    }

    #[test]
    fn test_artifact_kind_display() {
        assert_eq!(ArtifactKind::File.to_string(), "file");
        assert_eq!(ArtifactKind::Directory.to_string(), "directory");
    }
}
