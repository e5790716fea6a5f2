//! Locating tool executables before a run.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Finds the executable `program` would launch.
///
/// Names containing a path separator are checked as given; bare names
/// are searched for on `PATH`.
#[must_use]
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH").unwrap_or_default();
    resolve_program_in(program, &path_var)
}

/// Like [`resolve_program`], searching `path_var` instead of `PATH`.
#[must_use]
pub fn resolve_program_in(program: &str, path_var: &OsStr) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }

    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    env::split_paths(path_var)
        .map(|dir| dir.join(program))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
