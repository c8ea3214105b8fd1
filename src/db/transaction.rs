use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::TaskOp;
use crate::storage::{StorageMetrics, TxOptions};
use crate::types::{Result, TaskError, TxId};

/// The state of a transaction.
///
/// Pending transactions accept operations; the other two states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    /// Accepting operations, nothing applied yet.
    Pending,
    /// Every operation applied and the commit marker is durable.
    Committed,
    /// Discarded, either on request, after a failed commit or by the timeout sweep.
    RolledBack,
}

impl TxState {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            TxState::Pending => "pending",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a registered transaction.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    /// Transaction id.
    pub id: TxId,
    /// Current state.
    pub state: TxState,
    /// Operations queued, or applied once committed.
    pub operations: usize,
    /// Paths changed by a successful commit.
    pub affected: Vec<String>,
    /// Milliseconds since `begin`.
    pub age_ms: u64,
}

struct TxEntry {
    ops: Vec<TaskOp>,
    op_count: usize,
    state: TxState,
    /// Set while the store applies the operations.
    committing: bool,
    started: Instant,
    finished: Option<Instant>,
    affected: Vec<String>,
}

impl TxEntry {
    fn expired(&self, now: Instant, timeout: Duration) -> bool {
        self.state == TxState::Pending
            && !self.committing
            && now.saturating_duration_since(self.started) >= timeout
    }
}

/// Tracks explicit transactions between `begin` and their terminal state.
pub(crate) struct TxRegistry {
    next_id: AtomicU64,
    options: TxOptions,
    metrics: Arc<dyn StorageMetrics>,
    entries: Mutex<FxHashMap<TxId, TxEntry>>,
}

impl TxRegistry {
    pub(crate) fn new(first_id: TxId, options: TxOptions, metrics: Arc<dyn StorageMetrics>) -> Self {
        Self {
            next_id: AtomicU64::new(first_id.max(1)),
            options,
            metrics,
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Hands out an id without registering it. Used by single-operation calls.
    pub(crate) fn allocate_id(&self) -> TxId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn begin(&self) -> TxId {
        let id = self.allocate_id();
        self.entries.lock().insert(
            id,
            TxEntry {
                ops: Vec::new(),
                op_count: 0,
                state: TxState::Pending,
                committing: false,
                started: Instant::now(),
                finished: None,
                affected: Vec::new(),
            },
        );
        debug!(tx_id = id, "txn.begin");
        id
    }

    pub(crate) fn add(&self, tx_id: TxId, op: TaskOp) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = self.pending_entry(&mut entries, tx_id)?;
        if entry.ops.len() >= self.options.max_operations {
            return Err(TaskError::LimitExceeded {
                what: "transaction operations",
                limit: self.options.max_operations,
            });
        }
        entry.ops.push(op);
        entry.op_count = entry.ops.len();
        Ok(())
    }

    /// Moves the queued operations out for the store to apply.
    pub(crate) fn begin_commit(&self, tx_id: TxId) -> Result<Vec<TaskOp>> {
        let mut entries = self.entries.lock();
        let entry = self.pending_entry(&mut entries, tx_id)?;
        entry.committing = true;
        Ok(std::mem::take(&mut entry.ops))
    }

    /// Records the outcome of a commit started with `begin_commit`.
    pub(crate) fn finish_commit(&self, tx_id: TxId, affected: Option<Vec<String>>) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&tx_id) {
            entry.committing = false;
            entry.finished = Some(Instant::now());
            match affected {
                Some(paths) => {
                    entry.state = TxState::Committed;
                    entry.affected = paths;
                }
                None => entry.state = TxState::RolledBack,
            }
        }
    }

    /// Discards a pending transaction. Nothing was applied, so there is nothing to undo.
    pub(crate) fn rollback(&self, tx_id: TxId) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = self.pending_entry(&mut entries, tx_id)?;
        entry.ops.clear();
        entry.state = TxState::RolledBack;
        entry.finished = Some(Instant::now());
        drop(entries);
        self.metrics.tx_rolled_back(false);
        debug!(tx_id, "txn.rollback");
        Ok(())
    }

    pub(crate) fn state(&self, tx_id: TxId) -> Option<TxState> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&tx_id)?;
        if entry.expired(now, self.options.timeout) {
            self.force_rollback(tx_id, entry, now);
        }
        Some(entry.state)
    }

    pub(crate) fn info(&self, tx_id: TxId) -> Option<TransactionInfo> {
        let state = self.state(tx_id)?;
        let entries = self.entries.lock();
        let entry = entries.get(&tx_id)?;
        Some(TransactionInfo {
            id: tx_id,
            state,
            operations: entry.op_count,
            affected: entry.affected.clone(),
            age_ms: entry.started.elapsed().as_millis() as u64,
        })
    }

    pub(crate) fn pending(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.state == TxState::Pending)
            .count()
    }

    /// Rolls back expired pending transactions and forgets terminal ones past retention.
    /// Returns `(expired, purged)`.
    pub(crate) fn sweep(&self) -> (usize, usize) {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> (usize, usize) {
        let mut entries = self.entries.lock();
        let mut expired = 0;
        for (id, entry) in entries.iter_mut() {
            if entry.expired(now, self.options.timeout) {
                self.force_rollback(*id, entry, now);
                expired += 1;
            }
        }
        let before = entries.len();
        let retention = self.options.retention;
        entries.retain(|_, entry| {
            entry
                .finished
                .map_or(true, |at| now.saturating_duration_since(at) < retention)
        });
        (expired, before - entries.len())
    }

    fn pending_entry<'a>(
        &self,
        entries: &'a mut FxHashMap<TxId, TxEntry>,
        tx_id: TxId,
    ) -> Result<&'a mut TxEntry> {
        let now = Instant::now();
        let entry = entries.get_mut(&tx_id).ok_or_else(|| TaskError::InvalidState {
            tx_id,
            state: "unknown".into(),
        })?;
        if entry.expired(now, self.options.timeout) {
            self.force_rollback(tx_id, entry, now);
        }
        if entry.state != TxState::Pending || entry.committing {
            let state = if entry.committing {
                "committing".to_string()
            } else {
                entry.state.to_string()
            };
            return Err(TaskError::InvalidState { tx_id, state });
        }
        Ok(entry)
    }

    fn force_rollback(&self, tx_id: TxId, entry: &mut TxEntry, now: Instant) {
        warn!(
            tx_id,
            operations = entry.ops.len(),
            age_ms = now.saturating_duration_since(entry.started).as_millis() as u64,
            "txn.timeout"
        );
        entry.ops.clear();
        entry.state = TxState::RolledBack;
        entry.finished = Some(now);
        self.metrics.tx_rolled_back(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTask;
    use crate::storage::CounterMetrics;

    fn registry(max_operations: usize) -> (Arc<CounterMetrics>, TxRegistry) {
        let metrics = Arc::new(CounterMetrics::default());
        let options = TxOptions {
            max_operations,
            timeout: Duration::from_secs(5),
            retention: Duration::from_secs(10),
        };
        let registry = TxRegistry::new(1, options, metrics.clone());
        (metrics, registry)
    }

    fn op(path: &str) -> TaskOp {
        TaskOp::Create(NewTask::new(path))
    }

    #[test]
    fn operations_are_bounded() {
        let (_, registry) = registry(2);
        let tx = registry.begin();
        registry.add(tx, op("a")).unwrap();
        registry.add(tx, op("b")).unwrap();
        assert!(matches!(
            registry.add(tx, op("c")),
            Err(TaskError::LimitExceeded { limit: 2, .. })
        ));
    }

    #[test]
    fn terminal_transactions_reject_operations() {
        let (metrics, registry) = registry(8);
        let tx = registry.begin();
        registry.rollback(tx).unwrap();
        assert_eq!(registry.state(tx), Some(TxState::RolledBack));
        assert!(matches!(
            registry.add(tx, op("a")),
            Err(TaskError::InvalidState { .. })
        ));
        assert!(registry.rollback(tx).is_err());
        assert_eq!(metrics.tx_rolled_back.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn commit_takes_operations_once() {
        let (_, registry) = registry(8);
        let tx = registry.begin();
        registry.add(tx, op("a")).unwrap();
        let ops = registry.begin_commit(tx).unwrap();
        assert_eq!(ops.len(), 1);
        assert!(registry.begin_commit(tx).is_err());
        registry.finish_commit(tx, Some(vec!["a".into()]));
        let info = registry.info(tx).unwrap();
        assert_eq!(info.state, TxState::Committed);
        assert_eq!(info.affected, vec!["a"]);
        assert_eq!(info.operations, 1);
    }

    #[test]
    fn sweep_expires_then_purges() {
        let (metrics, registry) = registry(8);
        let tx = registry.begin();
        let later = Instant::now() + Duration::from_secs(6);
        assert_eq!(registry.sweep_at(later), (1, 0));
        assert_eq!(registry.state(tx), Some(TxState::RolledBack));
        assert_eq!(metrics.tx_timed_out.load(Ordering::Relaxed), 1);

        let much_later = later + Duration::from_secs(11);
        assert_eq!(registry.sweep_at(much_later), (0, 1));
        assert_eq!(registry.state(tx), None);
    }

    #[test]
    fn committing_transactions_are_not_swept() {
        let (_, registry) = registry(8);
        let tx = registry.begin();
        registry.begin_commit(tx).unwrap();
        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(registry.sweep_at(later), (0, 0));
    }
}
