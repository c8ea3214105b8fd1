use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::store::StoreInner;
use crate::primitives::pool::PoolHealth;
use crate::primitives::wal::CheckpointOutcome;
use crate::storage::{ImageCheckpoint, PrimaryImage};
use crate::types::Result;

enum MaintenanceMessage {
    Shutdown,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    /// Expired cache entries dropped.
    pub cache_expired: usize,
    /// Idle connections closed.
    pub connections_pruned: usize,
    /// Result of the pool health probe.
    pub pool_health: Option<PoolHealth>,
    /// Pending transactions rolled back for timing out.
    pub transactions_expired: usize,
    /// Terminal transactions forgotten.
    pub transactions_purged: usize,
    /// Checkpoint run because a threshold was crossed.
    pub checkpoint: Option<CheckpointOutcome>,
}

/// Background thread running [`StoreInner::run_maintenance`] on an interval.
pub(crate) struct MaintenanceWorker {
    sender: Sender<MaintenanceMessage>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MaintenanceWorker {
    pub(crate) fn spawn(inner: &Arc<StoreInner>, interval: Duration) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let store = Arc::downgrade(inner);
        let handle = thread::Builder::new()
            .name("taskvault-maint".into())
            .spawn(move || maintenance_loop(store, receiver, interval))?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    pub(crate) fn shutdown(&mut self) {
        let _ = self.sender.send(MaintenanceMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("maintenance.worker_panicked");
            }
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn maintenance_loop(store: Weak<StoreInner>, receiver: Receiver<MaintenanceMessage>, interval: Duration) {
    loop {
        match receiver.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let Some(inner) = store.upgrade() else {
                    break;
                };
                if inner.is_closed() {
                    break;
                }
                inner.run_maintenance();
            }
            Ok(MaintenanceMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("maintenance.stopped");
}

impl StoreInner {
    /// One pass of cache cleanup, pool upkeep, transaction sweep and, when the log asks
    /// for it, a checkpoint. Failures are logged and never stop the pass.
    pub(crate) fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if self.is_closed() {
            return report;
        }
        report.cache_expired = self.cache.cleanup();
        report.connections_pruned = self.pool.prune_idle();
        match self.pool.health_check() {
            Ok(health) => report.pool_health = Some(health),
            Err(err) => warn!(error = %err, "maintenance.pool_health_failed"),
        }
        let (expired, purged) = self.txs.sweep();
        report.transactions_expired = expired;
        report.transactions_purged = purged;
        if self.wal.should_checkpoint() {
            match self.checkpoint() {
                Ok(outcome) => report.checkpoint = Some(outcome),
                Err(err) => warn!(error = %err, "checkpoint.failed"),
            }
        }
        debug!(
            cache_expired = report.cache_expired,
            pruned = report.connections_pruned,
            tx_expired = report.transactions_expired,
            checkpointed = report.checkpoint.is_some(),
            "maintenance.tick"
        );
        report
    }

    /// Folds sealed WAL segments into the primary file.
    pub(crate) fn checkpoint(&self) -> Result<CheckpointOutcome> {
        let _serial = self.checkpoint_lock.lock();
        let started = Instant::now();
        // Read through a fresh handle: only checkpoints replace the file and they hold
        // `checkpoint_lock`, so this always sees the latest image.
        let image = PrimaryImage::load(self.options.io.open(&self.primary_path)?.as_ref())?;
        let mut target =
            ImageCheckpoint::new(&self.primary_path, image, Arc::clone(&self.options.io));
        let outcome = self.wal.checkpoint(&mut target)?;
        if outcome.segments > 0 {
            // Handles opened before the rename still point at the old file.
            self.pool.bump_generation();
            self.options.metrics.checkpoint(outcome.records_applied);
        }
        info!(
            segments = outcome.segments,
            applied = outcome.records_applied,
            checkpoint_seq = outcome.checkpoint_seq.0,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checkpoint.complete"
        );
        Ok(outcome)
    }
}
