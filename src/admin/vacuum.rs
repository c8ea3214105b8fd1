use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{file_size, millis_since, open_store};
use crate::admin::Result;
use crate::db::VacuumOutcome;

/// Report generated after a vacuum completes.
#[derive(Debug, Clone, Serialize)]
pub struct VacuumReport {
    /// Duration of the vacuum in milliseconds.
    pub duration_ms: f64,
    /// Primary file size before the vacuum.
    pub primary_bytes_before: u64,
    /// Primary file size afterwards.
    pub primary_bytes_after: u64,
    /// What the store cleaned up.
    #[serde(flatten)]
    pub outcome: VacuumOutcome,
}

/// Checkpoints the store in `dir`, drops expired cache entries and transactions,
/// prunes idle connections and removes temp files left by interrupted writes.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the checkpoint fails.
pub fn vacuum(dir: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<VacuumReport> {
    let start = Instant::now();
    let store = open_store(dir.as_ref(), opts)?;
    let primary = store.options().primary_path();
    let primary_bytes_before = file_size(&primary);
    let outcome = store.vacuum()?;
    store.close()?;
    let report = VacuumReport {
        duration_ms: millis_since(start),
        primary_bytes_before,
        primary_bytes_after: file_size(&primary),
        outcome,
    };
    info!(
        segments = report.outcome.segments_reclaimed,
        temp_files = report.outcome.temp_files_removed,
        duration_ms = report.duration_ms,
        "admin.vacuum.completed"
    );
    Ok(report)
}
