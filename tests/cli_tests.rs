//! CLI tests
//!
//! Exercises the maestro binary end to end: validate, run with the command
//! executor, status, and the exit-code contract.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn write_task(run_dir: &Path, file: &str, yaml: &str) {
    let tasks = run_dir.join("tasks");
    std::fs::create_dir_all(&tasks).unwrap();
    std::fs::write(tasks.join(file), yaml).unwrap();
}

fn write_config(run_dir: &Path, yaml: &str) {
    std::fs::write(run_dir.join("maestro.yaml"), yaml).unwrap();
}

fn maestro() -> Command {
    Command::cargo_bin("maestro").unwrap()
}

#[test]
fn validate_accepts_a_clean_run_dir() {
    let run = tempfile::tempdir().unwrap();
    write_task(
        run.path(),
        "a.yaml",
        "id: A\ntitle: \"a\"\nowner: backend\npriority: MED\n",
    );

    maestro()
        .arg("validate")
        .arg(run.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("1 task definitions valid"));
}

#[test]
fn validate_lists_every_violation() {
    let run = tempfile::tempdir().unwrap();
    write_task(
        run.path(),
        "a.yaml",
        "id: A\ntitle: \"a\"\nowner: backend\npriority: MED\ndependsOn: [B]\n",
    );
    write_task(
        run.path(),
        "b.yaml",
        "id: B\ntitle: \"b\"\nowner: backend\npriority: MED\ndependsOn: [A, GHOST]\n",
    );

    maestro()
        .arg("validate")
        .arg(run.path())
        .assert()
        .code(3)
        .stderr(predicate::str::contains("GHOST"))
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn validate_rejects_unknown_fields() {
    let run = tempfile::tempdir().unwrap();
    write_task(
        run.path(),
        "a.yaml",
        "id: A\ntitle: \"a\"\nowner: backend\npriority: MED\nmagic: true\n",
    );

    maestro()
        .arg("validate")
        .arg(run.path())
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Fix:"));
}

#[test]
fn run_zero_tasks_exits_zero() {
    let run = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(run.path().join("tasks")).unwrap();

    maestro().arg("run").arg(run.path()).assert().success();
}

#[test]
fn run_with_command_executor_succeeds() {
    let run = tempfile::tempdir().unwrap();
    write_task(
        run.path(),
        "a.yaml",
        "id: A\ntitle: \"greet\"\nowner: backend\npriority: MED\n",
    );
    write_config(
        run.path(),
        "maxParallel: 2\nexecutor: command\nroleCommands:\n  backend: \"echo done-$MAESTRO_TASK_ID\"\n",
    );

    maestro()
        .arg("run")
        .arg(run.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("done=1"));

    // Metrics snapshot persisted for the dashboard pull model
    let metrics = run.path().join("state/metrics.json");
    assert!(metrics.exists());
}

#[test]
fn run_with_failing_command_exits_one() {
    let run = tempfile::tempdir().unwrap();
    write_task(
        run.path(),
        "a.yaml",
        "id: A\ntitle: \"boom\"\nowner: backend\npriority: MED\n",
    );
    write_config(
        run.path(),
        "maxParallel: 1\nexecutor: command\nroleCommands:\n  backend: \"exit 7\"\nretry:\n  maxAttempts: 1\n  backoffBase: 10ms\n  backoffFactor: 1\n  jitter: 0.0\n",
    );

    maestro().arg("run").arg(run.path()).assert().code(1);
}

#[test]
fn status_prints_persisted_snapshot() {
    let run = tempfile::tempdir().unwrap();
    write_task(
        run.path(),
        "a.yaml",
        "id: A\ntitle: \"a\"\nowner: backend\npriority: MED\n",
    );
    write_config(
        run.path(),
        "maxParallel: 1\nexecutor: command\nroleCommands:\n  backend: \"echo ok\"\n",
    );

    maestro().arg("run").arg(run.path()).assert().success();

    maestro()
        .arg("status")
        .arg(run.path().join("state"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"version\": 1"))
        .stdout(predicate::str::contains("completionRate"));
}

#[test]
fn status_without_snapshot_fails() {
    let empty = tempfile::tempdir().unwrap();
    maestro()
        .arg("status")
        .arg(empty.path())
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn executor_override_flag_wins_over_config() {
    let run = tempfile::tempdir().unwrap();
    write_task(
        run.path(),
        "a.yaml",
        "id: A\ntitle: \"a\"\nowner: backend\npriority: MED\n",
    );
    // Config says command (which would fail: no roleCommands); flag says mock
    write_config(run.path(), "maxParallel: 1\nexecutor: command\n");

    maestro()
        .arg("run")
        .arg(run.path())
        .arg("--executor")
        .arg("mock")
        .assert()
        .success();
}
