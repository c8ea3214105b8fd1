use std::fs;
use std::path::Path;

use crate::db::TaskStore;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// Opens the store kept in `dir`.
///
/// # Errors
///
/// Returns [`AdminError::NotADirectory`] if `dir` exists but is not a directory,
/// [`AdminError::MissingStore`] if the primary file doesn't exist and
/// `create_if_missing` is false, or any error raised while recovering the store.
pub fn open_store(dir: &Path, opts: &AdminOpenOptions) -> Result<TaskStore> {
    if dir.exists() && !dir.is_dir() {
        return Err(AdminError::NotADirectory {
            path: dir.to_path_buf(),
        });
    }
    let store_opts = opts.store_options(dir);
    let primary = store_opts.primary_path();
    if !primary.exists() && !opts.create_if_missing {
        return Err(AdminError::MissingStore { primary });
    }
    Ok(TaskStore::open(store_opts)?)
}

/// Size of the file at `path`, zero when it is absent.
pub(crate) fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

pub(crate) fn millis_since(start: std::time::Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1_000.0
}
