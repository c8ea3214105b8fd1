use std::collections::BTreeMap;

use serde::Serialize;

use crate::primitives::pool::PoolStats;
use crate::storage::CacheStats;

/// Point-in-time counters for a whole store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreMetrics {
    /// Tasks in the table.
    pub total_tasks: usize,
    /// Task count per status name.
    pub by_status: BTreeMap<String, usize>,
    /// Cache hit rate since open.
    pub cache_hit_rate: f64,
    /// Cache counters.
    pub cache: CacheStats,
    /// Bytes held by live WAL segments.
    pub wal_size: u64,
    /// Live WAL segments.
    pub wal_segments: usize,
    /// Highest sequence folded into the primary file.
    pub checkpoint_seq: u64,
    /// Pool counters.
    pub pool: PoolStats,
    /// Explicit transactions still pending.
    pub pending_transactions: usize,
}

impl StoreMetrics {
    /// Multi-line human readable summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("tasks:            {}\n", self.total_tasks));
        for (status, count) in &self.by_status {
            out.push_str(&format!("  {status:<14}  {count}\n"));
        }
        out.push_str(&format!(
            "cache:            {} entries, {:.2}% hit rate\n",
            self.cache.entries,
            self.cache_hit_rate * 100.0
        ));
        out.push_str(&format!(
            "wal:              {} bytes in {} segments, checkpoint seq {}\n",
            self.wal_size, self.wal_segments, self.checkpoint_seq
        ));
        out.push_str(&format!(
            "pool:             {} live, {} idle, {} waiting\n",
            self.pool.live, self.pool.idle, self.pool.waiting
        ));
        out.push_str(&format!(
            "transactions:     {} pending\n",
            self.pending_transactions
        ));
        out
    }
}
