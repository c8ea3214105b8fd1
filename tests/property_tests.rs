#![allow(missing_docs)]

use proptest::prelude::*;
use taskvault::{
    NewTask, StoreOptions, SyncMode, TaskOp, TaskPatch, TaskStatus, TaskStore,
};

const PATHS: [&str; 7] = ["a", "a/b", "a/b/c", "a/d", "e", "e/f", "e/f/g"];

#[derive(Debug, Clone)]
enum Step {
    Single(TaskOp),
    Batch(Vec<TaskOp>),
}

fn arb_status() -> impl Strategy<Value = TaskStatus> {
    prop::sample::select(TaskStatus::ALL.to_vec())
}

fn arb_deps() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(prop::sample::select(PATHS.to_vec()), 0..3)
        .prop_map(|deps| deps.into_iter().map(String::from).collect())
}

fn parent_of(path: &str) -> Option<String> {
    path.rsplit_once('/').map(|(parent, _)| parent.to_string())
}

fn arb_op() -> impl Strategy<Value = TaskOp> {
    let path = prop::sample::select(PATHS.to_vec());
    prop_oneof![
        4 => (path.clone(), any::<bool>(), arb_deps(), prop::option::of(arb_status())).prop_map(
            |(path, with_parent, deps, status)| {
                let mut task = NewTask::new(path);
                if with_parent {
                    task.parent_path = parent_of(path);
                }
                task.dependencies = deps;
                task.status = status;
                TaskOp::Create(task)
            }
        ),
        3 => (path.clone(), prop::option::of(arb_status()), prop::option::of(arb_deps())).prop_map(
            |(path, status, dependencies)| TaskOp::Update {
                path: path.to_string(),
                patch: TaskPatch {
                    status,
                    dependencies,
                    ..TaskPatch::default()
                },
            }
        ),
        1 => path.prop_map(|path| TaskOp::Delete { path: path.to_string() }),
    ]
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => arb_op().prop_map(Step::Single),
        1 => prop::collection::vec(arb_op(), 1..4).prop_map(Step::Batch),
    ]
}

fn apply(store: &TaskStore, step: Step) {
    match step {
        Step::Single(TaskOp::Create(task)) => {
            let _ = store.create_task(task);
        }
        Step::Single(TaskOp::Update { path, patch }) => {
            let _ = store.update_task(&path, patch);
        }
        Step::Single(TaskOp::Delete { path }) => {
            let _ = store.delete_task(&path);
        }
        Step::Batch(ops) => {
            let tx = store.begin_transaction().expect("begin");
            for op in ops {
                store.add_operation(tx, op).expect("queue");
            }
            let _ = store.commit(tx);
        }
    }
}

fn assert_consistent(store: &TaskStore) {
    let report = store.verify();
    assert!(report.is_ok(), "{:?}", report.issues);

    let all = store.list_tasks();
    let by_status: usize = TaskStatus::ALL
        .iter()
        .map(|status| store.tasks_by_status(*status).len())
        .sum();
    assert_eq!(by_status, all.len());

    for task in &all {
        for dep in &task.dependencies {
            assert!(
                store
                    .dependent_tasks(dep)
                    .iter()
                    .any(|dependent| dependent.path == task.path),
                "{} missing from dependents of {dep}",
                task.path
            );
        }
        if let Some(parent) = &task.parent_path {
            assert!(store
                .tasks_by_parent(parent)
                .iter()
                .any(|child| child.path == task.path));
        }
        assert!(store
            .project_tasks(&task.path)
            .iter()
            .any(|member| member.path == task.path));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn indices_match_table_after_any_sequence(steps in prop::collection::vec(arb_step(), 1..40)) {
        let dir = tempfile::tempdir().unwrap();
        let opts = StoreOptions::new(dir.path())
            .maintenance_interval(None)
            .sync_mode(SyncMode::Off);
        let store = TaskStore::open(opts.clone()).unwrap();
        for step in steps {
            apply(&store, step);
            assert_consistent(&store);
        }
        let before = store.list_tasks();
        store.close().unwrap();
        drop(store);

        let store = TaskStore::open(opts).unwrap();
        prop_assert_eq!(store.list_tasks(), before);
        assert_consistent(&store);
    }

    #[test]
    fn cache_never_changes_answers(steps in prop::collection::vec(arb_step(), 1..25)) {
        let cached_dir = tempfile::tempdir().unwrap();
        let plain_dir = tempfile::tempdir().unwrap();
        let cached = TaskStore::open(
            StoreOptions::new(cached_dir.path()).maintenance_interval(None).sync_mode(SyncMode::Off),
        )
        .unwrap();
        let plain = TaskStore::open(
            StoreOptions::new(plain_dir.path())
                .maintenance_interval(None)
                .sync_mode(SyncMode::Off)
                .cache_capacity(0),
        )
        .unwrap();
        for step in steps {
            apply(&cached, step.clone());
            apply(&plain, step);
            for path in PATHS {
                let a = cached.get_task(path).unwrap().map(|t| (t.status, t.version, t.dependencies));
                let b = plain.get_task(path).unwrap().map(|t| (t.status, t.version, t.dependencies));
                prop_assert_eq!(a, b);
            }
        }
    }
}
