use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::health::{Check, HealthCheck};
use super::maintenance::{MaintenanceReport, MaintenanceWorker};
use super::metrics::StoreMetrics;
use super::transaction::{TransactionInfo, TxRegistry, TxState};
use super::verify::{check_table, VerifyReport};
use crate::model::{now_millis, NewTask, Task, TaskOp, TaskPatch, TaskStatus};
use crate::primitives::pool::ConnectionPool;
use crate::primitives::wal::{CheckpointOutcome, RecordBody, WalManager, WalStatus};
use crate::storage::primary::apply_record;
use crate::storage::{CacheManager, PrimaryImage, StoreOptions, TaskIndex};
use crate::types::{Result, TaskError, TxId};
use crate::validation::is_path_ancestor;

/// Minimum cache hit rate before the health check complains.
const CACHE_HIT_RATE_THRESHOLD: f64 = 0.5;
/// Lookups needed before the hit rate is judged.
const CACHE_HIT_RATE_MIN_LOOKUPS: u64 = 100;

/// Outcome of one operation inside a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OpResult {
    /// The created task.
    Created {
        /// Task as stored.
        task: Task,
    },
    /// The task after the update.
    Updated {
        /// Task as stored.
        task: Task,
    },
    /// Paths removed by a cascading delete, deepest first.
    Deleted {
        /// Removed paths.
        paths: Vec<String>,
    },
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitResult {
    /// Transaction id.
    pub tx_id: TxId,
    /// One entry per operation, in order.
    pub results: Vec<OpResult>,
    /// Every path the transaction changed, dependents cleaned up by deletes included.
    pub affected: Vec<String>,
}

/// Result of [`TaskStore::vacuum`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VacuumOutcome {
    /// WAL segments folded and reclaimed.
    pub segments_reclaimed: usize,
    /// WAL records folded into the primary file.
    pub records_applied: usize,
    /// Expired cache entries dropped.
    pub cache_expired: usize,
    /// Pending transactions rolled back for timing out.
    pub transactions_expired: usize,
    /// Terminal transactions forgotten.
    pub transactions_purged: usize,
    /// Idle connections closed.
    pub connections_pruned: usize,
    /// Leftover temp files removed.
    pub temp_files_removed: usize,
}

/// Table and index, always updated together under one lock.
pub(crate) struct StoreState {
    pub(crate) table: BTreeMap<String, Task>,
    pub(crate) index: TaskIndex,
}

pub(crate) struct StoreInner {
    pub(crate) options: StoreOptions,
    pub(crate) primary_path: PathBuf,
    pub(crate) pool: ConnectionPool,
    pub(crate) wal: WalManager,
    pub(crate) cache: CacheManager,
    pub(crate) state: RwLock<StoreState>,
    pub(crate) txs: TxRegistry,
    /// Serialises checkpoints and vacuum.
    pub(crate) checkpoint_lock: Mutex<()>,
    closed: AtomicBool,
}

impl StoreInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TaskError::System("task store is closed".into()));
        }
        Ok(())
    }
}

/// Embedded, durable task store.
///
/// Owns the connection pool, write-ahead log, cache, index and transaction registry of
/// one primary file. Mutations are logged before they are applied in memory and become
/// durable when their commit marker is synced. Opening replays the log over the primary
/// file, so a store always comes back with every committed transaction.
///
/// # Example
///
/// ```no_run
/// use taskvault::{NewTask, StoreOptions, TaskStore};
///
/// let store = TaskStore::open(StoreOptions::new("/tmp/tasks"))?;
/// store.create_task(NewTask::new("proj"))?;
/// store.create_task(NewTask::new("proj/a").parent("proj"))?;
/// assert_eq!(store.project_tasks("proj/a").len(), 2);
/// store.close()?;
/// # Ok::<(), taskvault::TaskError>(())
/// ```
pub struct TaskStore {
    inner: Arc<StoreInner>,
    worker: Mutex<Option<MaintenanceWorker>>,
}

impl TaskStore {
    /// Opens or creates the store described by `options` and recovers it.
    pub fn open(options: StoreOptions) -> Result<Self> {
        options.validate()?;
        fs::create_dir_all(&options.storage_dir)?;
        let primary_path = options.primary_path();

        let pool = ConnectionPool::open(
            &primary_path,
            options.pool.clone(),
            Arc::clone(&options.io),
            options.pool_listener.clone(),
        )?;
        let image = {
            let conn = pool.acquire()?;
            PrimaryImage::load(conn.io().as_ref())?
        };
        let floor = image.applied_seq;
        let wal = WalManager::open(
            &primary_path,
            options.wal.clone(),
            Arc::clone(&options.io),
            floor,
        )?;

        let mut table = image.tasks;
        let summary = wal.replay_committed(floor, |_, record| {
            apply_record(&mut table, record);
            Ok(())
        })?;
        if wal.halted().is_none() && !summary.orphans.is_empty() {
            for tx_id in &summary.orphans {
                wal.abort_tx(*tx_id)?;
            }
            wal.sync()?;
            warn!(orphans = summary.orphans.len(), "store.recover.orphans_aborted");
        }

        let index = TaskIndex::build(&table)?;
        let cache = CacheManager::new(options.cache.clone());
        if options.cache.persist {
            let loaded = cache.load(&options.cache_path(), |path| {
                table.get(path).map(|task| task.version)
            });
            debug!(loaded, "store.open.cache_warmed");
        }

        let txs = TxRegistry::new(
            summary.max_tx_id + 1,
            options.tx.clone(),
            Arc::clone(&options.metrics),
        );
        info!(
            path = %primary_path.display(),
            tasks = table.len(),
            replayed = summary.applied,
            halted = wal.halted().is_some(),
            "store.open"
        );

        let interval = options.maintenance_interval;
        let inner = Arc::new(StoreInner {
            options,
            primary_path,
            pool,
            wal,
            cache,
            state: RwLock::new(StoreState { table, index }),
            txs,
            checkpoint_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        });
        let worker = match interval {
            Some(interval) => Some(MaintenanceWorker::spawn(&inner, interval)?),
            None => None,
        };
        Ok(Self {
            inner,
            worker: Mutex::new(worker),
        })
    }

    /// Options the store was opened with.
    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// Creates one task in its own transaction.
    pub fn create_task(&self, input: NewTask) -> Result<Task> {
        let result = self.execute_single(TaskOp::Create(input))?;
        match result {
            OpResult::Created { task } => Ok(task),
            other => Err(unexpected_result("create", other)),
        }
    }

    /// Applies `patch` to the task at `path` in its own transaction.
    pub fn update_task(&self, path: &str, patch: TaskPatch) -> Result<Task> {
        let result = self.execute_single(TaskOp::Update {
            path: path.to_string(),
            patch,
        })?;
        match result {
            OpResult::Updated { task } => Ok(task),
            other => Err(unexpected_result("update", other)),
        }
    }

    /// Deletes `path` and its descendants. Returns the removed paths, deepest first.
    pub fn delete_task(&self, path: &str) -> Result<Vec<String>> {
        let result = self.execute_single(TaskOp::Delete {
            path: path.to_string(),
        })?;
        match result {
            OpResult::Deleted { paths } => Ok(paths),
            other => Err(unexpected_result("delete", other)),
        }
    }

    /// Looks a task up, cache first.
    pub fn get_task(&self, path: &str) -> Result<Option<Task>> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.options.validator.validate(path, "get")?;
        let state = inner.state.read();
        if inner.cache.enabled() {
            if let Some(task) = inner.cache.get(path) {
                inner.options.metrics.cache_lookup(true);
                return Ok(Some(task));
            }
            inner.options.metrics.cache_lookup(false);
        }
        let task = state.table.get(path).cloned();
        if let Some(task) = &task {
            inner.cache.set(task.clone());
        }
        Ok(task)
    }

    /// Every task, ordered by path.
    pub fn list_tasks(&self) -> Vec<Task> {
        self.inner.state.read().table.values().cloned().collect()
    }

    /// Tasks with `status`, ordered by path.
    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        unwrap_arcs(self.inner.state.read().index.tasks_by_status(status))
    }

    /// Direct children of `parent`.
    pub fn tasks_by_parent(&self, parent: &str) -> Vec<Task> {
        unwrap_arcs(self.inner.state.read().index.tasks_by_parent(parent))
    }

    /// Every task in the project that contains `path`.
    pub fn project_tasks(&self, path: &str) -> Vec<Task> {
        unwrap_arcs(self.inner.state.read().index.project_tasks(path))
    }

    /// Tasks that depend on `path`.
    pub fn dependent_tasks(&self, path: &str) -> Vec<Task> {
        unwrap_arcs(self.inner.state.read().index.dependent_tasks(path))
    }

    /// Tasks without a parent.
    pub fn project_root_tasks(&self) -> Vec<Task> {
        unwrap_arcs(self.inner.state.read().index.project_root_tasks())
    }

    /// Starts an explicit transaction.
    pub fn begin_transaction(&self) -> Result<TxId> {
        self.inner.ensure_open()?;
        Ok(self.inner.txs.begin())
    }

    /// Queues `op` on a pending transaction. Nothing is applied until commit.
    pub fn add_operation(&self, tx_id: TxId, op: TaskOp) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.txs.add(tx_id, op)
    }

    /// Applies every queued operation atomically.
    ///
    /// On any failure the operations already applied are undone in reverse order, the
    /// transaction ends rolled back and the error is returned.
    pub fn commit(&self, tx_id: TxId) -> Result<CommitResult> {
        self.inner.ensure_open()?;
        let ops = self.inner.txs.begin_commit(tx_id)?;
        let result = self.execute(tx_id, &ops);
        self.inner.txs.finish_commit(
            tx_id,
            result.as_ref().ok().map(|done| done.affected.clone()),
        );
        result
    }

    /// Discards a pending transaction.
    pub fn rollback(&self, tx_id: TxId) -> Result<()> {
        self.inner.txs.rollback(tx_id)
    }

    /// State of a transaction, `None` once it is unknown or purged.
    pub fn transaction_state(&self, tx_id: TxId) -> Option<TxState> {
        self.inner.txs.state(tx_id)
    }

    /// Details of a transaction, `None` once it is unknown or purged.
    pub fn transaction_info(&self, tx_id: TxId) -> Option<TransactionInfo> {
        self.inner.txs.info(tx_id)
    }

    /// Point-in-time counters.
    pub fn metrics(&self) -> StoreMetrics {
        let inner = &self.inner;
        let (total_tasks, by_status) = {
            let state = inner.state.read();
            let by_status = state
                .index
                .status_counts()
                .into_iter()
                .map(|(status, count)| (status.as_str().to_string(), count))
                .collect();
            (state.table.len(), by_status)
        };
        let cache = inner.cache.stats();
        let wal = inner.wal.status();
        StoreMetrics {
            total_tasks,
            by_status,
            cache_hit_rate: cache.hit_rate(),
            cache,
            wal_size: wal.size_bytes,
            wal_segments: wal.segments.len(),
            checkpoint_seq: wal.checkpoint_seq.0,
            pool: inner.pool.stats(),
            pending_transactions: inner.txs.pending(),
        }
    }

    /// Folds committed WAL records into the primary file and reclaims their segments.
    pub fn checkpoint(&self) -> Result<CheckpointOutcome> {
        self.inner.ensure_open()?;
        self.inner.checkpoint()
    }

    /// Checkpoints, drops expired cache entries and finished transactions, closes idle
    /// connections and removes temp files left by interrupted writes.
    pub fn vacuum(&self) -> Result<VacuumOutcome> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let checkpoint = inner.checkpoint()?;
        let cache_expired = inner.cache.cleanup();
        let (transactions_expired, transactions_purged) = inner.txs.sweep();
        let connections_pruned = inner.pool.prune_idle();
        let temp_files_removed = {
            let _serial = inner.checkpoint_lock.lock();
            // Commits rewrite the manifest under the state write lock.
            let _state = inner.state.read();
            remove_temp_files(inner)?
        };
        let outcome = VacuumOutcome {
            segments_reclaimed: checkpoint.segments,
            records_applied: checkpoint.records_applied,
            cache_expired,
            transactions_expired,
            transactions_purged,
            connections_pruned,
            temp_files_removed,
        };
        info!(?outcome, "store.vacuum");
        Ok(outcome)
    }

    /// Drops every cache entry.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Runs one maintenance pass now, independent of the background schedule.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        self.inner.run_maintenance()
    }

    /// Snapshot of the write-ahead log.
    pub fn wal_status(&self) -> WalStatus {
        self.inner.wal.status()
    }

    /// Evaluates cache, log and pool health.
    pub fn health(&self) -> HealthCheck {
        let inner = &self.inner;
        let mut health = HealthCheck::new();

        let cache = inner.cache.stats();
        let lookups = cache.hits + cache.misses;
        let rate = cache.hit_rate();
        health.add_check(Check::CacheHitRate {
            current: rate,
            threshold: CACHE_HIT_RATE_THRESHOLD,
            healthy: !inner.cache.enabled()
                || lookups < CACHE_HIT_RATE_MIN_LOOKUPS
                || rate >= CACHE_HIT_RATE_THRESHOLD,
        });

        let wal = inner.wal.status();
        let wal_limit = inner.options.wal.checkpoint_bytes.saturating_mul(2);
        health.add_check(Check::WalSize {
            bytes: wal.size_bytes,
            threshold: wal_limit,
            healthy: wal.size_bytes <= wal_limit,
        });
        health.add_check(Check::WalHalted {
            healthy: wal.halted.is_none(),
            reason: wal.halted.clone(),
        });
        let gap = inner
            .options
            .wal
            .checkpoint_interval
            .map_or(u64::MAX, |interval| interval.as_secs().saturating_mul(2).max(1));
        let seconds_ago = wal.since_checkpoint.as_secs();
        let nothing_to_fold = wal.segments.iter().all(|meta| meta.last_seq.is_none());
        health.add_check(Check::LastCheckpoint {
            seconds_ago,
            threshold: gap,
            healthy: nothing_to_fold || seconds_ago <= gap,
        });

        let pool = inner.pool.stats();
        let max_waiting = inner.pool.options().max_waiting_clients;
        health.add_check(Check::PoolPressure {
            waiting: pool.waiting,
            max_waiting,
            // A fail-fast pool (no queue) never has waiters.
            healthy: pool.waiting == 0 || pool.waiting < max_waiting,
        });
        health
    }

    /// Checks the primary file, the log and the in-memory table and index.
    pub fn verify(&self) -> VerifyReport {
        let inner = &self.inner;
        let mut report = VerifyReport::default();

        match inner.pool.acquire() {
            Ok(conn) => match PrimaryImage::load(conn.io().as_ref()) {
                Ok(image) => {
                    report.primary_ok = true;
                    report.primary_tasks = image.tasks.len();
                }
                Err(err) => report.issues.push(format!("primary file: {err}")),
            },
            Err(err) => report.issues.push(format!("primary file not checked: {err}")),
        }

        let wal = inner.wal.status();
        report.wal_segments = wal.segments.len();
        if let Some(reason) = &wal.halted {
            report.issues.push(format!("wal halted: {reason}"));
        }
        report.issues.extend(inner.wal.verify_segments());

        let state = inner.state.read();
        report.tasks_checked = state.table.len();
        report.issues.extend(check_table(&state));
        drop(state);

        if report.is_ok() {
            info!(tasks = report.tasks_checked, "store.verify.ok");
        } else {
            warn!(issues = report.issues.len(), "store.verify.issues");
        }
        report
    }

    /// Stops background work, persists the cache if enabled and syncs the log.
    ///
    /// Later calls are no-ops. Dropping the store closes it too.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut worker) = self.worker.lock().take() {
            worker.shutdown();
        }
        // Waits for commits already past their open check.
        let _state = inner.state.write();
        if inner.options.cache.persist && inner.cache.enabled() {
            let path = inner.options.cache_path();
            match inner.cache.persist(&path) {
                Ok(entries) => debug!(entries, "store.close.cache_saved"),
                Err(err) => warn!(error = %err, "cache.persist.save_failed"),
            }
        }
        let synced = inner.wal.close();
        inner.pool.close();
        info!(path = %inner.primary_path.display(), "store.close");
        synced
    }

    fn execute_single(&self, op: TaskOp) -> Result<OpResult> {
        let tx_id = self.inner.txs.allocate_id();
        let mut done = self.execute(tx_id, std::slice::from_ref(&op))?;
        done.results
            .pop()
            .ok_or_else(|| TaskError::System(format!("{} produced no result", op.name())))
    }

    fn execute(&self, tx_id: TxId, ops: &[TaskOp]) -> Result<CommitResult> {
        let inner = &self.inner;
        inner.ensure_open()?;
        if ops.is_empty() {
            return Ok(CommitResult {
                tx_id,
                results: Vec::new(),
                affected: Vec::new(),
            });
        }
        let _conn = inner.pool.acquire()?;
        let mut guard = inner.state.write();
        inner.ensure_open()?;
        let state = &mut *guard;

        let mut applier = Applier::new(inner, tx_id);
        let outcome = applier
            .apply_all(state, ops)
            .and_then(|results| inner.wal.commit_tx(tx_id).map(|_| results));

        match outcome {
            Ok(results) => {
                let affected = dedup_paths(&applier.affected);
                for path in &affected {
                    match state.table.get(path) {
                        Some(task) => inner.cache.set(task.clone()),
                        None => {
                            inner.cache.delete(path);
                        }
                    }
                }
                drop(guard);
                let metrics = &inner.options.metrics;
                (0..applier.created).for_each(|_| metrics.task_created());
                (0..applier.updated).for_each(|_| metrics.task_updated());
                (0..applier.deleted).for_each(|_| metrics.task_deleted());
                metrics.tx_committed(ops.len());
                info!(
                    tx_id,
                    operations = ops.len(),
                    affected = affected.len(),
                    "txn.commit"
                );
                Ok(CommitResult {
                    tx_id,
                    results,
                    affected,
                })
            }
            Err(err) => {
                let touched = dedup_paths(&applier.affected);
                let undone = applier.undo.len();
                rollback_state(state, applier.undo);
                if applier.appended {
                    if let Err(abort_err) = inner.wal.abort_tx(tx_id) {
                        warn!(tx_id, error = %abort_err, "txn.abort_marker_failed");
                    }
                }
                for path in &touched {
                    inner.cache.delete(path);
                }
                drop(guard);
                inner.options.metrics.tx_rolled_back(false);
                warn!(tx_id, undone, error = %err, "txn.rollback");
                Err(err)
            }
        }
    }
}

impl Drop for TaskStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "store.close_failed");
        }
    }
}

/// Compensating action for one applied change.
enum Undo {
    /// Undo a create.
    Remove(String),
    /// Undo an update or delete by putting the prior record back.
    Restore(Task),
}

/// Applies the operations of one transaction and journals how to undo them.
struct Applier<'a> {
    inner: &'a StoreInner,
    tx_id: TxId,
    now: i64,
    undo: Vec<Undo>,
    /// Set once any record reached the log, so an abort marker is owed on failure.
    appended: bool,
    affected: Vec<String>,
    created: usize,
    updated: usize,
    deleted: usize,
}

impl<'a> Applier<'a> {
    fn new(inner: &'a StoreInner, tx_id: TxId) -> Self {
        Self {
            inner,
            tx_id,
            now: now_millis(),
            undo: Vec::new(),
            appended: false,
            affected: Vec::new(),
            created: 0,
            updated: 0,
            deleted: 0,
        }
    }

    fn apply_all(&mut self, state: &mut StoreState, ops: &[TaskOp]) -> Result<Vec<OpResult>> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                TaskOp::Create(input) => self
                    .create(state, input)
                    .map(|task| OpResult::Created { task }),
                TaskOp::Update { path, patch } => self
                    .update(state, path, patch)
                    .map(|task| OpResult::Updated { task }),
                TaskOp::Delete { path } => self
                    .delete(state, path)
                    .map(|paths| OpResult::Deleted { paths }),
            };
            match result {
                Ok(result) => results.push(result),
                Err(err) => {
                    debug!(
                        tx_id = self.tx_id,
                        op = op.name(),
                        path = op.path(),
                        error = %err,
                        "txn.op.rejected"
                    );
                    return Err(err);
                }
            }
        }
        Ok(results)
    }

    fn create(&mut self, state: &mut StoreState, input: &NewTask) -> Result<Task> {
        let inner = self.inner;
        let validator = &inner.options.validator;
        let path = input.path.as_str();
        validator.validate(path, "create")?;
        if state.table.contains_key(path) {
            return Err(TaskError::validation(path, "create", "task already exists"));
        }
        if let Some(parent) = &input.parent_path {
            validator.validate(parent, "create")?;
            if !is_path_ancestor(parent, path) {
                return Err(TaskError::validation(
                    path,
                    "create",
                    format!("parent {parent} is not an ancestor of the path"),
                ));
            }
            if !state.table.contains_key(parent) {
                return Err(TaskError::validation(
                    path,
                    "create",
                    format!("parent {parent} does not exist"),
                ));
            }
        }
        let task = input.clone().into_task(self.now);
        self.check_dependencies(state, &task, "create")?;
        if task.status == TaskStatus::Completed {
            check_completable(state, &task, TaskStatus::Pending)?;
        }

        self.log(RecordBody::Create { task: task.clone() })?;
        state.index.index_task(&task)?;
        state.table.insert(task.path.clone(), task.clone());
        self.undo.push(Undo::Remove(task.path.clone()));
        self.affected.push(task.path.clone());
        self.created += 1;
        Ok(task)
    }

    fn update(&mut self, state: &mut StoreState, path: &str, patch: &TaskPatch) -> Result<Task> {
        self.inner.options.validator.validate(path, "update")?;
        let current = state
            .table
            .get(path)
            .cloned()
            .ok_or_else(|| TaskError::not_found(path))?;
        if patch.is_empty() {
            return Err(TaskError::validation(path, "update", "patch changes nothing"));
        }
        let next = patch.apply_to(&current, self.now);
        if let Some(status) = patch.status {
            if !current.status.can_transition_to(status) {
                return Err(TaskError::StatusTransition {
                    path: path.to_string(),
                    from: current.status.to_string(),
                    to: status.to_string(),
                    reason: "transition not allowed".into(),
                });
            }
        }
        if patch.dependencies.is_some() {
            self.check_dependencies(state, &next, "update")?;
        }
        let completes = current.status != TaskStatus::Completed || patch.dependencies.is_some();
        if next.status == TaskStatus::Completed && completes {
            check_completable(state, &next, current.status)?;
        }

        self.log(RecordBody::Update { task: next.clone() })?;
        self.replace(state, current, next.clone())?;
        self.affected.push(next.path.clone());
        self.updated += 1;
        Ok(next)
    }

    fn delete(&mut self, state: &mut StoreState, path: &str) -> Result<Vec<String>> {
        self.inner.options.validator.validate(path, "delete")?;
        if !state.table.contains_key(path) {
            return Err(TaskError::not_found(path));
        }
        let doomed = state.index.subtree_post_order(path);
        let doomed_set: BTreeSet<&str> = doomed.iter().map(String::as_str).collect();

        let mut survivors = BTreeSet::new();
        for gone in &doomed {
            for dependent in state.index.dependent_tasks(gone) {
                if !doomed_set.contains(dependent.path.as_str()) {
                    survivors.insert(dependent.path.clone());
                }
            }
        }
        for survivor in survivors {
            let Some(current) = state.table.get(&survivor).cloned() else {
                continue;
            };
            let kept: Vec<String> = current
                .dependencies
                .iter()
                .filter(|dep| !doomed_set.contains(dep.as_str()))
                .cloned()
                .collect();
            let next = TaskPatch::dependencies(kept).apply_to(&current, self.now);
            self.log(RecordBody::Update { task: next.clone() })?;
            self.replace(state, current, next)?;
            self.affected.push(survivor);
            self.updated += 1;
        }

        for gone in &doomed {
            let Some(prior) = state.table.get(gone).cloned() else {
                continue;
            };
            self.log(RecordBody::Delete { path: gone.clone() })?;
            state.index.unindex_task(gone)?;
            state.table.remove(gone);
            self.undo.push(Undo::Restore(prior));
            self.affected.push(gone.clone());
            self.deleted += 1;
        }
        Ok(doomed)
    }

    fn check_dependencies(&self, state: &StoreState, task: &Task, operation: &'static str) -> Result<()> {
        for dep in &task.dependencies {
            self.inner.options.validator.validate(dep, operation)?;
            if dep != &task.path && !state.table.contains_key(dep) {
                return Err(TaskError::validation(
                    task.path.clone(),
                    operation,
                    format!("dependency {dep} does not exist"),
                ));
            }
        }
        if let Some(cycle) = state.index.has_cycle_with(&task.path, &task.dependencies) {
            return Err(TaskError::DependencyCycle {
                path: task.path.clone(),
                cycle,
            });
        }
        Ok(())
    }

    /// Swaps `prior` for `next` in table and index.
    fn replace(&mut self, state: &mut StoreState, prior: Task, next: Task) -> Result<()> {
        state.index.unindex_task(&prior.path)?;
        if let Err(err) = state.index.index_task(&next) {
            if let Err(restore) = state.index.index_task(&prior) {
                error!(path = %prior.path, error = %restore, "index.restore_failed");
            }
            return Err(err);
        }
        state.table.insert(next.path.clone(), next);
        self.undo.push(Undo::Restore(prior));
        Ok(())
    }

    fn log(&mut self, body: RecordBody) -> Result<()> {
        self.appended = true;
        self.inner.wal.append(self.tx_id, body)?;
        Ok(())
    }
}

/// Undoes applied changes newest first. The table is always restored; if the index
/// disagrees afterwards it is rebuilt from the table.
fn rollback_state(state: &mut StoreState, undo: Vec<Undo>) {
    let mut clean = true;
    for step in undo.into_iter().rev() {
        let result = match step {
            Undo::Remove(path) => {
                let result = state.index.unindex_task(&path).map(drop);
                state.table.remove(&path);
                result
            }
            Undo::Restore(prior) => {
                let removed = if state.table.contains_key(&prior.path) {
                    state.index.unindex_task(&prior.path).map(drop)
                } else {
                    Ok(())
                };
                let indexed = state.index.index_task(&prior);
                state.table.insert(prior.path.clone(), prior);
                removed.and(indexed)
            }
        };
        if let Err(err) = result {
            error!(error = %err, "txn.rollback.undo_failed");
            clean = false;
        }
    }
    if !clean {
        if let Err(err) = state.index.rebuild(&state.table) {
            error!(error = %err, "txn.rollback.rebuild_failed");
        }
    }
}

fn check_completable(state: &StoreState, task: &Task, from: TaskStatus) -> Result<()> {
    for dep in &task.dependencies {
        let done = state
            .table
            .get(dep)
            .is_some_and(|dep_task| dep_task.status == TaskStatus::Completed);
        if !done {
            return Err(TaskError::StatusTransition {
                path: task.path.clone(),
                from: from.to_string(),
                to: TaskStatus::Completed.to_string(),
                reason: format!("dependency {dep} is not completed"),
            });
        }
    }
    Ok(())
}

fn dedup_paths(paths: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    paths
        .iter()
        .filter(|path| seen.insert(path.as_str()))
        .cloned()
        .collect()
}

fn unwrap_arcs(tasks: Vec<Arc<Task>>) -> Vec<Task> {
    tasks.into_iter().map(|task| (*task).clone()).collect()
}

fn unexpected_result(operation: &str, result: OpResult) -> TaskError {
    TaskError::System(format!("{operation} returned {result:?}"))
}

/// Removes `<primary>*.tmp` files left by interrupted atomic replacements.
fn remove_temp_files(inner: &StoreInner) -> Result<usize> {
    let prefix = inner.options.file_name.as_str();
    let mut removed = 0;
    for entry in fs::read_dir(&inner.options.storage_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(prefix) && name.ends_with(".tmp") {
            fs::remove_file(entry.path())?;
            debug!(file = name, "store.vacuum.temp_removed");
            removed += 1;
        }
    }
    Ok(removed)
}
