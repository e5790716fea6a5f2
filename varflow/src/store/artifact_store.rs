//! Filesystem layout for pipeline artifacts.

use crate::core::{Artifact, ArtifactKind};
use crate::errors::StorageError;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Name of the directory, under the base directory, that holds staged outputs.
pub const STAGING_DIR: &str = ".varflow-staging";

/// How strictly an existing output is judged to be complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletenessCheck {
    /// The object exists with the declared kind.
    #[default]
    Presence,
    /// As `Presence`, and files are non-empty and directories have an entry.
    NonEmpty,
}

/// Resolves artifact paths and manages their existence on disk.
///
/// Produced artifacts with relative paths live under the base directory.
/// Supplied inputs and absolute paths are taken as given.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_dir: PathBuf,
    completeness: CompletenessCheck,
}

impl ArtifactStore {
    /// Creates a store rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            completeness: CompletenessCheck::default(),
        }
    }

    /// Sets the completeness check.
    #[must_use]
    pub fn with_completeness(mut self, completeness: CompletenessCheck) -> Self {
        self.completeness = completeness;
        self
    }

    /// Returns the base output directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the completeness check in use.
    #[must_use]
    pub fn completeness(&self) -> CompletenessCheck {
        self.completeness
    }

    /// Returns the filesystem location of an artifact.
    #[must_use]
    pub fn resolve(&self, artifact: &Artifact) -> PathBuf {
        if artifact.path.is_absolute() || !artifact.is_produced() {
            artifact.path.clone()
        } else {
            self.base_dir.join(&artifact.path)
        }
    }

    /// Returns where `stage` writes `artifact` before it is moved into place.
    #[must_use]
    pub fn staging_path(&self, stage: &str, artifact: &Artifact) -> PathBuf {
        self.staging_dir(stage).join(staged_name(artifact))
    }

    /// Returns the staging directory of `stage`.
    #[must_use]
    pub fn staging_dir(&self, stage: &str) -> PathBuf {
        self.base_dir.join(STAGING_DIR).join(stage)
    }

    /// Removes whatever an earlier attempt of `stage` left in staging.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the directory exists but cannot be removed.
    pub fn clear_staging(&self, stage: &str) -> Result<(), StorageError> {
        let dir = self.staging_dir(stage);
        if !dir.exists() {
            return Ok(());
        }
        debug!(stage = %stage, path = %dir.display(), "Clearing stale staged outputs");
        fs::remove_dir_all(&dir).map_err(|source| StorageError::ClearStaging { path: dir, source })
    }

    /// Removes the staging directory of `stage` and the staging root if they are empty.
    pub fn release_staging(&self, stage: &str) {
        let dir = self.staging_dir(stage);
        let root = self.base_dir.join(STAGING_DIR);
        for path in [dir.as_path(), root.as_path()] {
            if let Err(err) = fs::remove_dir(path) {
                trace!(path = %path.display(), error = %err, "Staging directory kept");
            }
        }
    }

    /// Returns true iff the object at the artifact's path is present and matches its kind.
    #[must_use]
    pub fn exists(&self, artifact: &Artifact) -> bool {
        path_matches_kind(&self.resolve(artifact), artifact.kind)
    }

    /// Returns true if the artifact exists and passes the completeness check.
    #[must_use]
    pub fn is_complete(&self, artifact: &Artifact) -> bool {
        self.is_complete_at(&self.resolve(artifact), artifact.kind)
    }

    /// Applies the completeness check to an arbitrary path.
    #[must_use]
    pub fn is_complete_at(&self, path: &Path, kind: ArtifactKind) -> bool {
        if !path_matches_kind(path, kind) {
            return false;
        }
        match self.completeness {
            CompletenessCheck::Presence => true,
            CompletenessCheck::NonEmpty => match kind {
                ArtifactKind::File => fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false),
                ArtifactKind::Directory => fs::read_dir(path)
                    .map(|mut entries| entries.next().is_some())
                    .unwrap_or(false),
            },
        }
    }

    /// Creates the artifact's containing directory tree if absent.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if creation fails or a non-directory occupies
    /// a required path segment.
    pub fn ensure_parent(&self, artifact: &Artifact) -> Result<PathBuf, StorageError> {
        let path = self.resolve(artifact);
        ensure_parent_of(&path)?;
        Ok(path)
    }

    /// Creates the base output directory.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the directory cannot be created.
    pub fn ensure_base_dir(&self) -> Result<(), StorageError> {
        ensure_dir(&self.base_dir)
    }

    /// Makes `path` ready to receive an output of the given kind.
    ///
    /// Files get their parent tree; directories are created themselves,
    /// since tools writing into a directory expect it to exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the required directories cannot be created.
    pub fn prepare_output(&self, path: &Path, kind: ArtifactKind) -> Result<(), StorageError> {
        match kind {
            ArtifactKind::File => ensure_parent_of(path),
            ArtifactKind::Directory => ensure_dir(path),
        }
    }

    /// Moves a staged output into the artifact's final location.
    ///
    /// Existing files are replaced. An existing directory receives the
    /// staged entries, overwriting same-named ones.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the final location cannot be prepared or
    /// the rename fails.
    pub fn commit(&self, staged: &Path, artifact: &Artifact) -> Result<PathBuf, StorageError> {
        let target = self.ensure_parent(artifact)?;
        debug!(artifact = %artifact.id, from = %staged.display(), to = %target.display(), "Committing staged output");

        if artifact.kind == ArtifactKind::Directory && target.is_dir() {
            merge_dir(staged, &target)?;
            if let Err(err) = fs::remove_dir(staged) {
                trace!(path = %staged.display(), error = %err, "Staging directory left behind");
            }
        } else {
            rename(staged, &target)?;
        }
        Ok(target)
    }
}

/// Returns where `artifact` sits inside its stage's staging directory.
///
/// Relative paths keep their layout. Absolute paths keep only their file
/// name, so two outputs of one stage must not share it.
#[must_use]
pub fn staged_name(artifact: &Artifact) -> PathBuf {
    if artifact.path.is_absolute() {
        PathBuf::from(artifact.path.file_name().unwrap_or_else(|| OsStr::new(&artifact.id)))
    } else {
        artifact.path.clone()
    }
}

fn path_matches_kind(path: &Path, kind: ArtifactKind) -> bool {
    match kind {
        ArtifactKind::File => path.is_file(),
        ArtifactKind::Directory => path.is_dir(),
    }
}

fn ensure_parent_of(path: &Path) -> Result<(), StorageError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent),
        _ => Ok(()),
    }
}

fn ensure_dir(dir: &Path) -> Result<(), StorageError> {
    if dir.is_dir() {
        return Ok(());
    }
    for segment in dir.ancestors() {
        if segment.as_os_str().is_empty() {
            continue;
        }
        if segment.exists() && !segment.is_dir() {
            return Err(StorageError::NotADirectory {
                path: segment.to_path_buf(),
            });
        }
    }
    fs::create_dir_all(dir).map_err(|source| StorageError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

fn rename(from: &Path, to: &Path) -> Result<(), StorageError> {
    fs::rename(from, to).map_err(|source| StorageError::Commit {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

fn merge_dir(from: &Path, to: &Path) -> Result<(), StorageError> {
    let entries = fs::read_dir(from).map_err(|source| StorageError::Commit {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| StorageError::Commit {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })?;
        let source_path = entry.path();
        let target_path = to.join(entry.file_name());

        if source_path.is_dir() && target_path.is_dir() {
            merge_dir(&source_path, &target_path)?;
            if let Err(err) = fs::remove_dir(&source_path) {
                trace!(path = %source_path.display(), error = %err, "Staged subdirectory left behind");
            }
        } else {
            rename(&source_path, &target_path)?;
        }
    }
    Ok(())
}
