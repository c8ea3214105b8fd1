#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use taskvault::storage::CounterMetrics;
use taskvault::{
    NewTask, OpResult, StoreOptions, TaskError, TaskOp, TaskPatch, TaskStatus, TaskStore,
    TxOptions, TxState,
};
use tempfile::TempDir;

fn open_with(dir: &TempDir, tx: TxOptions) -> TaskStore {
    TaskStore::open(
        StoreOptions::new(dir.path())
            .maintenance_interval(None)
            .tx(tx),
    )
    .expect("open store")
}

fn open(dir: &TempDir) -> TaskStore {
    open_with(dir, TxOptions::default())
}

#[test]
fn queued_operations_apply_only_on_commit() {
    let dir = TempDir::new().expect("tempdir");
    let store = open(&dir);
    let tx = store.begin_transaction().expect("begin");
    store
        .add_operation(tx, TaskOp::Create(NewTask::new("proj")))
        .expect("queue");
    store
        .add_operation(tx, TaskOp::Create(NewTask::new("proj/a").parent("proj")))
        .expect("queue");
    assert!(store.get_task("proj").expect("get").is_none());
    assert_eq!(store.transaction_state(tx), Some(TxState::Pending));

    let done = store.commit(tx).expect("commit");
    assert_eq!(done.tx_id, tx);
    assert!(matches!(&done.results[1], OpResult::Created { task } if task.path == "proj/a"));
    assert_eq!(store.tasks_by_parent("proj").len(), 1);
}

#[test]
fn operations_see_earlier_operations_of_same_transaction() {
    let dir = TempDir::new().expect("tempdir");
    let store = open(&dir);
    let tx = store.begin_transaction().expect("begin");
    for op in [
        TaskOp::Create(NewTask::new("x")),
        TaskOp::Create(NewTask::new("y").depends_on("x")),
        TaskOp::Update {
            path: "x".into(),
            patch: TaskPatch::status(TaskStatus::Completed),
        },
        TaskOp::Update {
            path: "y".into(),
            patch: TaskPatch::status(TaskStatus::Completed),
        },
    ] {
        store.add_operation(tx, op).expect("queue");
    }
    let done = store.commit(tx).expect("commit");
    assert_eq!(done.affected, vec!["x", "y"]);
    assert_eq!(store.tasks_by_status(TaskStatus::Completed).len(), 2);
}

#[test]
fn explicit_rollback_discards_queue() {
    let dir = TempDir::new().expect("tempdir");
    let metrics = Arc::new(CounterMetrics::default());
    let store = TaskStore::open(
        StoreOptions::new(dir.path())
            .maintenance_interval(None)
            .metrics(metrics.clone()),
    )
    .expect("open");
    let tx = store.begin_transaction().expect("begin");
    store
        .add_operation(tx, TaskOp::Create(NewTask::new("gone")))
        .expect("queue");
    store.rollback(tx).expect("rollback");
    assert_eq!(store.transaction_state(tx), Some(TxState::RolledBack));
    assert!(store.get_task("gone").expect("get").is_none());
    assert_eq!(metrics.tx_rolled_back.load(Ordering::Relaxed), 1);

    for result in [
        store.commit(tx).map(drop),
        store.rollback(tx),
        store.add_operation(tx, TaskOp::Delete { path: "gone".into() }),
    ] {
        match result {
            Err(TaskError::InvalidState { tx_id, state }) => {
                assert_eq!(tx_id, tx);
                assert_eq!(state, "rolled_back");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn unknown_transactions_are_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let store = open(&dir);
    assert!(matches!(
        store.commit(4242),
        Err(TaskError::InvalidState { ref state, .. }) if state == "unknown"
    ));
    assert!(store.transaction_state(4242).is_none());
}

#[test]
fn stale_transactions_time_out_and_are_purged() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_with(
        &dir,
        TxOptions {
            max_operations: 10,
            timeout: Duration::from_millis(20),
            retention: Duration::from_millis(50),
        },
    );
    let tx = store.begin_transaction().expect("begin");
    store
        .add_operation(tx, TaskOp::Create(NewTask::new("late")))
        .expect("queue");
    thread::sleep(Duration::from_millis(40));

    let report = store.run_maintenance();
    assert_eq!(report.transactions_expired, 1);
    assert_eq!(store.transaction_state(tx), Some(TxState::RolledBack));
    assert!(store.commit(tx).is_err());

    thread::sleep(Duration::from_millis(80));
    let report = store.run_maintenance();
    assert_eq!(report.transactions_purged, 1);
    assert!(store.transaction_info(tx).is_none());
}

#[test]
fn transaction_ids_keep_growing_across_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let first = {
        let store = open(&dir);
        let tx = store.begin_transaction().expect("begin");
        store
            .add_operation(tx, TaskOp::Create(NewTask::new("a")))
            .expect("queue");
        store.commit(tx).expect("commit");
        tx
    };
    let store = open(&dir);
    let next = store.begin_transaction().expect("begin");
    assert!(next > first);
}
