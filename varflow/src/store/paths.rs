//! Deterministic sibling-path derivation.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// A naming transform applied to the final component of a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PathTransform {
    /// Insert text before the last extension: `aligned.bam` -> `aligned_sorted.bam`.
    Suffix(String),
    /// Append an extension: `aligned_sorted.bam` -> `aligned_sorted.bam.bai`.
    AppendExtension(String),
    /// Replace the last extension: `aligned.sam` -> `aligned.bam`.
    ReplaceExtension(String),
}

/// Computes a sibling of `base` by applying `transform` to its file name.
///
/// The result depends only on the inputs, so repeated runs derive identical
/// paths.
#[must_use]
pub fn derived_path(base: &Path, transform: &PathTransform) -> PathBuf {
    let Some(file_name) = base.file_name() else {
        let mut raw = base.as_os_str().to_os_string();
        raw.push(transform_tail(transform));
        return PathBuf::from(raw);
    };

    let derived = match transform {
        PathTransform::Suffix(suffix) => {
            let mut name: OsString = base.file_stem().unwrap_or(file_name).to_os_string();
            name.push(suffix);
            if let Some(ext) = base.extension() {
                name.push(".");
                name.push(ext);
            }
            name
        }
        PathTransform::AppendExtension(ext) => {
            let mut name = file_name.to_os_string();
            name.push(".");
            name.push(ext);
            name
        }
        PathTransform::ReplaceExtension(ext) => {
            return base.with_extension(ext);
        }
    };

    base.with_file_name(derived)
}

fn transform_tail(transform: &PathTransform) -> String {
    match transform {
        PathTransform::Suffix(suffix) => suffix.clone(),
        PathTransform::AppendExtension(ext) | PathTransform::ReplaceExtension(ext) => {
            format!(".{ext}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_before_extension() {
        let sorted = derived_path(Path::new("out/aligned.bam"), &PathTransform::Suffix("_sorted".into()));
        assert_eq!(sorted, PathBuf::from("out/aligned_sorted.bam"));
    }

    #[test]
    fn test_suffix_without_extension() {
        let derived = derived_path(Path::new("reads"), &PathTransform::Suffix("_trimmed".into()));
        assert_eq!(derived, PathBuf::from("reads_trimmed"));
    }

    #[test]
    fn test_suffix_uses_last_extension_only() {
        let derived = derived_path(Path::new("sample.R1.fq"), &PathTransform::Suffix("_sub".into()));
        assert_eq!(derived, PathBuf::from("sample.R1_sub.fq"));
    }

    #[test]
    fn test_append_extension() {
        let index = derived_path(
            Path::new("aligned_sorted.bam"),
            &PathTransform::AppendExtension("bai".into()),
        );
        assert_eq!(index, PathBuf::from("aligned_sorted.bam.bai"));
    }

    #[test]
    fn test_replace_extension() {
        let bam = derived_path(Path::new("aligned.sam"), &PathTransform::ReplaceExtension("bam".into()));
        assert_eq!(bam, PathBuf::from("aligned.bam"));
    }

    #[test]
    fn test_derivation_is_deterministic_and_distinct() {
        let transform = PathTransform::Suffix("_sorted".into());
        let first = derived_path(Path::new("a/aligned.bam"), &transform);
        let second = derived_path(Path::new("a/aligned.bam"), &transform);
        let other = derived_path(Path::new("a/other.bam"), &transform);

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_ne!(first, PathBuf::from("a/aligned.bam"));
    }
}
