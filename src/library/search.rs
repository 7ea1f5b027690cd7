// Library file naming and search
//
// Maps a logical basename to a platform file name and finds it in the
// caller's directories, then MODELKIT_LIBRARY_PATH, then the working
// directory and its ancestors.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{LibraryError, Result};

/// Environment variable holding extra search directories
pub const LIBRARY_PATH_ENV: &str = "MODELKIT_LIBRARY_PATH";

/// How many ancestors of the working directory are searched
const ANCESTOR_DEPTH: usize = 5;

#[cfg(windows)]
const LIBRARY_EXTENSION: &str = "dll";
#[cfg(not(windows))]
const LIBRARY_EXTENSION: &str = "so";

/// Platform-specific file name for a library basename
pub fn platform_file_name(basename: &str) -> String {
    format!("{}.{}", basename, LIBRARY_EXTENSION)
}

/// Every location that would be tried for `basename`, in search order
pub fn candidate_paths(basename: &str, search_paths: &[PathBuf]) -> Vec<PathBuf> {
    let file_name = platform_file_name(basename);
    let mut dirs: Vec<PathBuf> = search_paths.to_vec();

    if let Some(paths) = std::env::var_os(LIBRARY_PATH_ENV) {
        dirs.extend(std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()));
    }

    if let Ok(cwd) = std::env::current_dir() {
        dirs.extend(cwd.ancestors().take(ANCESTOR_DEPTH + 1).map(Path::to_path_buf));
    }

    let mut candidates: Vec<PathBuf> = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let candidate = dir.join(&file_name);
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}

/// Locate the library file for `basename`
pub fn locate_library(basename: &str, search_paths: &[PathBuf]) -> Result<PathBuf> {
    let candidates = candidate_paths(basename, search_paths);

    match candidates.iter().find(|p| p.is_file()) {
        Some(found) => {
            debug!(basename, path = %found.display(), "Located model library");
            Ok(found.clone())
        }
        None => Err(LibraryError::LibraryNotFound {
            basename: basename.to_string(),
            searched: candidates,
        }),
    }
}
