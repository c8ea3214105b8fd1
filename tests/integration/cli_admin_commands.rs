#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

/// A command isolated from the user's config and log settings.
fn cli(home: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("taskvault");
    cmd.env("XDG_CONFIG_HOME", home)
        .env("HOME", home)
        .env_remove("TASKVAULT_DIR")
        .env("TASKVAULT_LOG", "off");
    cmd
}

fn json(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("valid json")
}

fn setup() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    for args in [
        vec!["create", "proj", "--type", "group"],
        vec!["create", "proj/a", "--parent", "proj", "--meta", "points=3"],
        vec!["create", "proj/b", "--parent", "proj", "--depends-on", "proj/a"],
    ] {
        cli(dir.path())
            .arg("--dir")
            .arg(dir.path())
            .args(args)
            .assert()
            .success();
    }
    dir
}

#[test]
fn create_and_get_emit_json() {
    let dir = setup();
    let task = json(
        cli(dir.path())
            .arg("--dir")
            .arg(dir.path())
            .args(["--format", "json", "get", "proj/a"]),
    );
    assert_eq!(task["path"], "proj/a");
    assert_eq!(task["parent_path"], "proj");
    assert_eq!(task["status"], "pending");
    assert_eq!(task["metadata"]["points"], 3);
    assert_eq!(task["version"], 1);
}

#[test]
fn get_missing_task_exits_with_three() {
    let dir = setup();
    cli(dir.path())
        .arg("--dir")
        .arg(dir.path())
        .args(["get", "proj/nope"])
        .assert()
        .code(3);
}

#[test]
fn commands_other_than_create_require_existing_store() {
    let dir = TempDir::new().expect("tempdir");
    cli(dir.path())
        .arg("--dir")
        .arg(dir.path())
        .arg("stats")
        .assert()
        .code(1);
    assert!(!dir.path().join("tasks.db").exists());
}

#[test]
fn update_then_list_by_status() {
    let dir = setup();
    let task = json(
        cli(dir.path())
            .arg("--dir")
            .arg(dir.path())
            .args(["--format", "json", "update", "proj/a", "--status", "in-progress"]),
    );
    assert_eq!(task["status"], "in_progress");
    assert_eq!(task["version"], 2);

    let listed = json(
        cli(dir.path())
            .arg("--dir")
            .arg(dir.path())
            .args(["--format", "json", "list", "--status", "in_progress"]),
    );
    let paths: Vec<&str> = listed
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|task| task["path"].as_str())
        .collect();
    assert_eq!(paths, ["proj/a"]);

    let dependents = json(
        cli(dir.path())
            .arg("--dir")
            .arg(dir.path())
            .args(["--format", "json", "list", "--dependents-of", "proj/a"]),
    );
    assert_eq!(dependents[0]["path"], "proj/b");
}

#[test]
fn rejected_update_fails_without_changes() {
    let dir = setup();
    cli(dir.path())
        .arg("--dir")
        .arg(dir.path())
        .args(["update", "proj/a", "--depends-on", "proj/b"])
        .assert()
        .failure()
        .code(1);
    let task = json(
        cli(dir.path())
            .arg("--dir")
            .arg(dir.path())
            .args(["--format", "json", "get", "proj/a"]),
    );
    assert!(task.get("dependencies").is_none());
    assert_eq!(task["version"], 1);
}

#[test]
fn delete_removes_subtree() {
    let dir = setup();
    let removed = json(
        cli(dir.path())
            .arg("--dir")
            .arg(dir.path())
            .args(["--format", "json", "delete", "proj"]),
    );
    assert_eq!(removed.as_array().expect("array").len(), 3);
    let listed = json(
        cli(dir.path())
            .arg("--dir")
            .arg(dir.path())
            .args(["--format", "json", "list"]),
    );
    assert!(listed.as_array().expect("array").is_empty());
}

#[test]
fn stats_emits_json() {
    let dir = setup();
    let stats = json(
        cli(dir.path())
            .arg("--dir")
            .arg(dir.path())
            .args(["--format", "json", "stats"]),
    );
    assert_eq!(stats["store"]["total_tasks"], 3);
    assert!(stats["wal"]["segments"].is_number());
    assert!(stats["filesystem"]["primary_size_bytes"].is_number());
}

#[test]
fn checkpoint_folds_log() {
    let dir = setup();
    let report = json(
        cli(dir.path())
            .arg("--dir")
            .arg(dir.path())
            .args(["--format", "json", "checkpoint"]),
    );
    assert_eq!(report["records_applied"], 3);
    assert!(report["checkpoint_seq"].as_u64().expect("seq") > 0);
}

#[test]
fn verify_succeeds_on_healthy_store() {
    let dir = setup();
    let report = json(
        cli(dir.path())
            .arg("--dir")
            .arg(dir.path())
            .args(["--format", "json", "verify"]),
    );
    assert!(report["success"].as_bool().unwrap_or(false));
    assert_eq!(report["counts"]["tasks"], 3);
}

#[test]
fn vacuum_removes_temp_file() {
    let dir = setup();
    let leftover = dir.path().join("tasks.db.tmp");
    fs::write(&leftover, b"partial").expect("leftover");
    let report = json(
        cli(dir.path())
            .arg("--dir")
            .arg(dir.path())
            .args(["--format", "json", "vacuum"]),
    );
    assert!(report["primary_bytes_after"].is_number());
    assert!(!leftover.exists());
}

#[test]
fn profile_supplies_directory() {
    let dir = setup();
    let config = dir.path().join("cli.toml");
    fs::write(
        &config,
        format!(
            "default_profile = \"work\"\n\n[profiles.work]\nstorage_dir = {:?}\n",
            dir.path().display().to_string()
        ),
    )
    .expect("config");
    let listed = json(
        cli(dir.path())
            .arg("--config")
            .arg(&config)
            .args(["--format", "json", "list", "--roots"]),
    );
    assert_eq!(listed[0]["path"], "proj");
}
