use std::path::Path;
use std::time::Instant;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{millis_since, open_store};
use crate::admin::Result;

/// Report generated after executing a checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    /// Duration of the checkpoint in milliseconds.
    pub duration_ms: f64,
    /// WAL segments folded and reclaimed.
    pub segments: usize,
    /// Records applied to the primary file.
    pub records_applied: usize,
    /// Highest sequence now reflected in the primary file.
    pub checkpoint_seq: u64,
}

/// Folds the WAL of the store in `dir` into its primary file.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the checkpoint fails.
pub fn checkpoint(dir: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<CheckpointReport> {
    let store = open_store(dir.as_ref(), opts)?;
    let start = Instant::now();
    let outcome = store.checkpoint()?;
    let report = CheckpointReport {
        duration_ms: millis_since(start),
        segments: outcome.segments,
        records_applied: outcome.records_applied,
        checkpoint_seq: outcome.checkpoint_seq.0,
    };
    store.close()?;
    Ok(report)
}
