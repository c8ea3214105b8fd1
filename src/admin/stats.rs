use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{file_size, open_store};
use crate::admin::Result;
use crate::db::StoreMetrics;

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub store: StoreMetrics,
    pub wal: WalStatsSection,
    pub filesystem: FilesystemStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalStatsSection {
    pub segments: usize,
    pub size_bytes: u64,
    pub next_seq: u64,
    pub checkpoint_seq: u64,
    pub inflight: usize,
    pub appended_records: u64,
    pub checkpoints: u64,
    pub halted: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilesystemStats {
    pub primary_path: String,
    pub primary_size_bytes: u64,
    pub cache_path: String,
    pub cache_size_bytes: u64,
}

pub fn stats(dir: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<StatsReport> {
    let dir = dir.as_ref();
    let store = open_store(dir, opts)?;
    let metrics = store.metrics();
    let wal = store.wal_status();
    let primary = store.options().primary_path();
    let cache = store.options().cache_path();

    let wal_section = WalStatsSection {
        segments: wal.segments.len(),
        size_bytes: wal.size_bytes,
        next_seq: wal.next_seq.0,
        checkpoint_seq: wal.checkpoint_seq.0,
        inflight: wal.inflight,
        appended_records: wal.stats.records_appended,
        checkpoints: wal.stats.checkpoints,
        halted: wal.halted,
    };
    let filesystem = FilesystemStats {
        primary_path: primary.display().to_string(),
        primary_size_bytes: file_size(&primary),
        cache_path: cache.display().to_string(),
        cache_size_bytes: file_size(&cache),
    };
    store.close()?;
    Ok(StatsReport {
        store: metrics,
        wal: wal_section,
        filesystem,
    })
}
