use std::fs;
use std::path::{Path, PathBuf};

use super::StorageError;

/// Expands a leading `~/` or `$HOME` against the `HOME` environment variable.
pub(crate) fn resolve_data_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    let home_suffix = raw_path
        .strip_prefix("~/")
        .map(|rest| format!("/{rest}"))
        .or_else(|| {
            (raw_path == "$HOME" || raw_path.starts_with("$HOME/"))
                .then(|| raw_path.trim_start_matches("$HOME").to_owned())
        });

    let Some(suffix) = home_suffix else {
        return Ok(PathBuf::from(raw_path));
    };
    let home = std::env::var("HOME").map_err(|_| StorageError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(format!("{home}{suffix}")))
}

pub(crate) fn ensure_data_dir(path: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(path).map_err(|source| StorageError::CreateDataDir {
        path: path.to_path_buf(),
        source,
    })
}
