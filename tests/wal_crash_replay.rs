#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use taskvault::{NewTask, StoreOptions, Task, TaskPatch, TaskStatus, TaskStore};
use tempfile::TempDir;

fn open(dir: &Path) -> TaskStore {
    TaskStore::open(StoreOptions::new(dir).maintenance_interval(None)).expect("open store")
}

/// Leaves the store without closing it, as a killed process would.
fn crash(store: TaskStore) {
    std::mem::forget(store);
}

fn wal_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .expect("read dir")
        .map(|entry| entry.expect("entry").path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.contains("-wal.") || name.ends_with("-shm"))
        })
        .collect();
    files.sort();
    files
}

fn seed(store: &TaskStore) {
    store.create_task(NewTask::new("proj")).expect("proj");
    store
        .create_task(NewTask::new("proj/a").parent("proj"))
        .expect("proj/a");
    store
        .create_task(NewTask::new("proj/b").parent("proj").depends_on("proj/a"))
        .expect("proj/b");
    store
        .update_task("proj/a", TaskPatch::status(TaskStatus::InProgress))
        .expect("update");
    store.create_task(NewTask::new("tmp")).expect("tmp");
    store.delete_task("tmp").expect("delete");
}

fn snapshot(store: &TaskStore) -> Vec<Task> {
    store.list_tasks()
}

#[test]
fn committed_work_survives_crash() {
    let dir = TempDir::new().expect("tempdir");
    let before = {
        let store = open(dir.path());
        seed(&store);
        let tasks = snapshot(&store);
        crash(store);
        tasks
    };
    let store = open(dir.path());
    assert_eq!(snapshot(&store), before);
    assert!(store.verify().is_ok());
}

#[test]
fn torn_tail_is_truncated_on_recovery() {
    let dir = TempDir::new().expect("tempdir");
    let before = {
        let store = open(dir.path());
        seed(&store);
        let tasks = snapshot(&store);
        crash(store);
        tasks
    };
    let segment = wal_files(dir.path())
        .into_iter()
        .filter(|path| !path.to_string_lossy().ends_with("-shm"))
        .last()
        .expect("segment file");
    let mut file = OpenOptions::new().append(true).open(&segment).expect("open segment");
    file.write_all(&[0x00, 0x00, 0x01, 0x40, 0xde, 0xad]).expect("append garbage");
    drop(file);

    let store = open(dir.path());
    assert_eq!(snapshot(&store), before);
    assert!(store.wal_status().halted.is_none());
    store.create_task(NewTask::new("after")).expect("append after truncation");
    drop(store);

    let store = open(dir.path());
    assert!(store.get_task("after").expect("get").is_some());
    assert!(store.verify().is_ok());
}

#[test]
fn replaying_checkpointed_records_changes_nothing() {
    let dir = TempDir::new().expect("tempdir");
    let stash = TempDir::new().expect("stash");
    let before = {
        let store = open(dir.path());
        seed(&store);
        store.close().expect("close");
        for file in wal_files(dir.path()) {
            let name = file.file_name().expect("name");
            fs::copy(&file, stash.path().join(name)).expect("stash log");
        }
        let store = open(dir.path());
        let outcome = store.checkpoint().expect("checkpoint");
        assert!(outcome.records_applied > 0);
        let tasks = snapshot(&store);
        crash(store);
        tasks
    };

    // Crash between writing the primary file and reclaiming the log: the old
    // segments and manifest are still on disk.
    for file in wal_files(dir.path()) {
        fs::remove_file(file).expect("remove");
    }
    for file in wal_files(stash.path()) {
        let name = file.file_name().expect("name");
        fs::copy(&file, dir.path().join(name)).expect("restore log");
    }

    let store = open(dir.path());
    assert_eq!(snapshot(&store), before);
    let proj_b = store.get_task("proj/b").expect("get").expect("proj/b");
    assert_eq!(proj_b.version, 1);
    assert_eq!(
        store.get_task("proj/a").expect("get").expect("proj/a").version,
        2
    );
    assert!(store.verify().is_ok());

    store.checkpoint().expect("second checkpoint");
    drop(store);
    let store = open(dir.path());
    assert_eq!(snapshot(&store), before);
}

#[test]
fn checkpoint_then_more_writes_then_crash() {
    let dir = TempDir::new().expect("tempdir");
    let before = {
        let store = open(dir.path());
        seed(&store);
        store.checkpoint().expect("checkpoint");
        store
            .update_task("proj/b", TaskPatch::status(TaskStatus::Blocked))
            .expect("update after checkpoint");
        store.delete_task("proj/a").expect("delete after checkpoint");
        let tasks = snapshot(&store);
        crash(store);
        tasks
    };
    let store = open(dir.path());
    assert_eq!(snapshot(&store), before);
    let proj_b = store.get_task("proj/b").expect("get").expect("proj/b");
    assert!(proj_b.dependencies.is_empty());
    assert_eq!(proj_b.status, TaskStatus::Blocked);
}
