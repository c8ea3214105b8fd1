use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sink for store activity counters.
///
/// The store calls these hooks after the corresponding work is final: task hooks fire
/// once a transaction commits, never for operations that were rolled back.
pub trait StorageMetrics: Send + Sync {
    /// A task was created.
    fn task_created(&self);

    /// A task was updated, including dependency cleanup after deletes.
    fn task_updated(&self);

    /// A task was deleted.
    fn task_deleted(&self);

    /// A cache lookup finished.
    fn cache_lookup(&self, hit: bool);

    /// A transaction committed with `operations` queued operations.
    fn tx_committed(&self, operations: usize);

    /// A transaction was rolled back.
    ///
    /// # Parameters
    /// * `forced` - `true` when the timeout sweep rolled it back.
    fn tx_rolled_back(&self, forced: bool);

    /// A checkpoint folded `records` WAL records into the primary file.
    fn checkpoint(&self, records: usize);
}

/// Discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl StorageMetrics for NoopMetrics {
    fn task_created(&self) {}
    fn task_updated(&self) {}
    fn task_deleted(&self) {}
    fn cache_lookup(&self, _hit: bool) {}
    fn tx_committed(&self, _operations: usize) {}
    fn tx_rolled_back(&self, _forced: bool) {}
    fn checkpoint(&self, _records: usize) {}
}

/// Atomic counters, readable from any thread.
#[derive(Default, Debug)]
pub struct CounterMetrics {
    /// Tasks created.
    pub tasks_created: AtomicU64,
    /// Tasks updated.
    pub tasks_updated: AtomicU64,
    /// Tasks deleted.
    pub tasks_deleted: AtomicU64,
    /// Cache hits.
    pub cache_hits: AtomicU64,
    /// Cache misses.
    pub cache_misses: AtomicU64,
    /// Committed transactions.
    pub tx_committed: AtomicU64,
    /// Operations inside committed transactions.
    pub tx_operations: AtomicU64,
    /// Rolled back transactions, forced ones included.
    pub tx_rolled_back: AtomicU64,
    /// Transactions rolled back by the timeout sweep.
    pub tx_timed_out: AtomicU64,
    /// Checkpoints that folded at least one segment.
    pub checkpoints: AtomicU64,
    /// Records folded by checkpoints.
    pub checkpoint_records: AtomicU64,
}

impl StorageMetrics for CounterMetrics {
    fn task_created(&self) {
        self.tasks_created.fetch_add(1, Ordering::Relaxed);
    }

    fn task_updated(&self) {
        self.tasks_updated.fetch_add(1, Ordering::Relaxed);
    }

    fn task_deleted(&self) {
        self.tasks_deleted.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn tx_committed(&self, operations: usize) {
        self.tx_committed.fetch_add(1, Ordering::Relaxed);
        self.tx_operations
            .fetch_add(operations as u64, Ordering::Relaxed);
    }

    fn tx_rolled_back(&self, forced: bool) {
        self.tx_rolled_back.fetch_add(1, Ordering::Relaxed);
        if forced {
            self.tx_timed_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn checkpoint(&self, records: usize) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.checkpoint_records
            .fetch_add(records as u64, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation, [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn StorageMetrics> {
    Arc::new(NoopMetrics)
}
