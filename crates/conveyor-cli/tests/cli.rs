//! End-to-end tests driving the built `conveyor` binary against a
//! scratch working root (assert_cmd + predicates over a tempdir-rooted
//! command).

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;
use uuid::Uuid;

fn conveyor_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("conveyor"))
}

#[test]
fn doctor_on_fresh_root_reports_defaults_and_writable_storage() {
    let td = tempdir().expect("tempdir");

    conveyor_cmd()
        .arg("--root")
        .arg(td.path())
        .arg("doctor")
        .env_remove("SFTP_HOST")
        .env_remove("SFTP_USER")
        .env_remove("SFTP_PASSWORD")
        .env_remove("SFTP_BASE_DIR")
        .env_remove("CONVEYOR_WEBHOOK_SECRET")
        .assert()
        .success()
        .stdout(contains("conveyor.toml: using defaults"))
        .stdout(contains("config: valid"))
        .stdout(contains("storage: writable"))
        .stdout(contains("sftp credentials: incomplete"))
        .stdout(contains("notification: disabled"));
}

#[test]
fn status_with_no_runs_reports_empty() {
    let td = tempdir().expect("tempdir");

    conveyor_cmd()
        .arg("--root")
        .arg(td.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("no runs recorded under"));
}

#[test]
fn tick_on_unknown_run_fails() {
    let td = tempdir().expect("tempdir");
    let missing_run = Uuid::new_v4();

    conveyor_cmd()
        .arg("--root")
        .arg(td.path())
        .arg("tick")
        .arg("--resume")
        .arg(missing_run.to_string())
        .assert()
        .failure()
        .stderr(contains(format!("no run {missing_run}")));
}

#[test]
fn unknown_trigger_flag_is_rejected() {
    let td = tempdir().expect("tempdir");

    conveyor_cmd()
        .arg("--root")
        .arg(td.path())
        .arg("run")
        .arg("--trigger")
        .arg("whenever")
        .assert()
        .failure()
        .stderr(contains("unknown --trigger"));
}
