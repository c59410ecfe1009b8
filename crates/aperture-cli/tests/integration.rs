#![allow(deprecated)]
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn aperture(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("aperture").unwrap();
    cmd.current_dir(dir.path())
        .env("APERTURE_ROOT", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

fn init_workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    aperture(&dir).arg("init").assert().success();
    dir
}

fn write_request(dir: &TempDir, issue: &str, project: &str) {
    let body = format!(
        "issue_key: {issue}\nproject_key: {project}\nname: Demo\nrequested_by: alice\nusers: [bob]\ngroups: [devs]\n"
    );
    std::fs::write(
        dir.path().join(format!(".aperture/requests/{issue}.yaml")),
        body,
    )
    .unwrap();
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_workspace() {
    let dir = init_workspace();
    assert!(dir.path().join(".aperture").is_dir());
    assert!(dir.path().join(".aperture/requests").is_dir());
    let settings = std::fs::read_to_string(dir.path().join(".aperture/settings.yaml")).unwrap();
    assert!(settings.contains("delete-duration: 2w"));
}

#[test]
fn init_keeps_existing_settings() {
    let dir = init_workspace();
    aperture(&dir)
        .args(["config", "set", "delete-duration", "3d"])
        .assert()
        .success();
    aperture(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:"));
    aperture(&dir)
        .args(["config", "get", "delete-duration"])
        .assert()
        .success()
        .stdout("3d\n");
}

#[test]
fn commands_require_init() {
    let dir = TempDir::new().unwrap();
    aperture(&dir)
        .args(["jobs", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("aperture init"));
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

#[test]
fn config_get_falls_back_to_default() {
    let dir = init_workspace();
    aperture(&dir)
        .args(["config", "get", "backend-timeout"])
        .assert()
        .success()
        .stdout("2m\n");
}

#[test]
fn config_set_rejects_malformed_duration() {
    let dir = init_workspace();
    aperture(&dir)
        .args(["config", "set", "idle-interval", "weekly"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid duration"));
}

#[test]
fn config_set_rejects_durations_past_a_century() {
    let dir = init_workspace();
    aperture(&dir)
        .args(["config", "set", "delete-duration", "100000000w"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid duration"));
}

#[test]
fn config_unset_restores_default() {
    let dir = init_workspace();
    aperture(&dir)
        .args(["config", "set", "compensation-policy", "faulted-only"])
        .assert()
        .success();
    aperture(&dir)
        .args(["config", "unset", "compensation-policy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("unset: compensation-policy"));
    aperture(&dir)
        .args(["config", "get", "compensation-policy"])
        .assert()
        .success()
        .stdout("teardown\n");
}

#[test]
fn config_show_masks_tokens() {
    let dir = init_workspace();
    aperture(&dir)
        .args(["config", "link", "wiki", "https://wiki.example.com", "--token", "s3cret"])
        .assert()
        .success();
    aperture(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("link.wiki"))
        .stdout(predicate::str::contains("https://wiki.example.com"))
        .stdout(predicate::str::contains("s3cret").not());
}

// ---------------------------------------------------------------------------
// schedule
// ---------------------------------------------------------------------------

#[test]
fn schedule_create_needs_a_request() {
    let dir = init_workspace();
    aperture(&dir)
        .args(["schedule", "create", "REQ-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("REQ-1"));
}

#[test]
fn schedule_create_is_idempotent() {
    let dir = init_workspace();
    write_request(&dir, "REQ-1", "ABC");
    aperture(&dir)
        .args(["schedule", "create", "REQ-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("create of ABC for REQ-1 queued"));
    aperture(&dir)
        .args(["schedule", "create", "REQ-1"])
        .assert()
        .success();

    let out = aperture(&dir)
        .args(["--json", "jobs", "list"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let jobs: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(jobs.as_array().unwrap().len(), 1);
    assert_eq!(jobs[0]["kind"], "create");
    assert_eq!(jobs[0]["status"]["type"], "pending");
}

#[test]
fn removal_can_be_cancelled_inside_the_undo_window() {
    let dir = init_workspace();
    aperture(&dir)
        .args(["schedule", "remove", "ABC", "--by", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("in 2w"));
    aperture(&dir)
        .args(["schedule", "remove", "ABC", "--by", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already scheduled"));
    aperture(&dir)
        .args(["jobs", "removals"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ABC"));

    aperture(&dir)
        .args(["schedule", "cancel", "ABC"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cancelled"));
    aperture(&dir)
        .args(["jobs", "show", "remove", "ABC"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("job not found"));
    aperture(&dir)
        .args(["jobs", "removals"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending removals."));
}

#[test]
fn removal_rejects_bad_project_key() {
    let dir = init_workspace();
    aperture(&dir)
        .args(["schedule", "remove", "abc", "--by", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid project key"));
}

#[test]
fn cancelled_jobs_show_with_all_and_prune_keeps_recent() {
    let dir = init_workspace();
    aperture(&dir)
        .args(["schedule", "remove", "XYZ", "--by", "alice"])
        .assert()
        .success();
    aperture(&dir)
        .args(["schedule", "cancel", "XYZ"])
        .assert()
        .success();
    aperture(&dir)
        .args(["jobs", "list"])
        .assert()
        .success()
        .stdout("No jobs.\n");
    aperture(&dir)
        .args(["jobs", "list", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cancelled"));
    aperture(&dir)
        .args(["jobs", "prune"])
        .assert()
        .success()
        .stdout("pruned 0 finished job(s)\n");
}

// ---------------------------------------------------------------------------
// daemon
// ---------------------------------------------------------------------------

#[test]
fn daemon_requires_automation_user() {
    let dir = init_workspace();
    aperture(&dir)
        .arg("daemon")
        .assert()
        .failure()
        .stderr(predicate::str::contains("automation-user"));
}

#[test]
fn daemon_requires_tracker_link() {
    let dir = init_workspace();
    aperture(&dir)
        .args(["config", "set", "automation-user", "aperture-bot"])
        .assert()
        .success();
    aperture(&dir)
        .arg("daemon")
        .assert()
        .failure()
        .stderr(predicate::str::contains("tracker is not linked"));
}

/// A daemon child process, killed when dropped.
struct Daemon(Child);

impl Daemon {
    fn spawn(dir: &TempDir) -> Self {
        let child = std::process::Command::new(assert_cmd::cargo::cargo_bin("aperture"))
            .arg("daemon")
            .current_dir(dir.path())
            .env("APERTURE_ROOT", dir.path())
            .env_remove("RUST_LOG")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        Daemon(child)
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn job_status(dir: &TempDir, kind: &str, subject: &str) -> Option<String> {
    let out = aperture(dir)
        .args(["--json", "jobs", "list", "--all"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let jobs: serde_json::Value = serde_json::from_slice(&out).unwrap();
    jobs.as_array()
        .unwrap()
        .iter()
        .find(|j| j["kind"] == kind && j["subject_key"] == subject)
        .and_then(|j| j["status"]["type"].as_str().map(str::to_string))
}

fn wait_for_status(dir: &TempDir, kind: &str, subject: &str, want: &str) {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let status = job_status(dir, kind, subject);
        if status.as_deref() == Some(want) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{kind} {subject} never reached {want}, last status {status:?}"
        );
        std::thread::sleep(Duration::from_millis(250));
    }
}

#[test]
fn running_daemon_provisions_and_removes_on_memory_backends() {
    let dir = init_workspace();
    for (key, value) in [
        ("automation-user", "aperture-bot"),
        ("tick-interval", "1s"),
        ("delete-duration", "1s"),
    ] {
        aperture(&dir)
            .args(["config", "set", key, value])
            .assert()
            .success();
    }
    aperture(&dir)
        .args(["config", "link", "tracker", "memory://"])
        .assert()
        .success();

    let _daemon = Daemon::spawn(&dir);

    // The CLI keeps working against the store while the daemon runs, and
    // links added now are used by the next job.
    aperture(&dir)
        .args(["config", "link", "wiki", "memory://"])
        .assert()
        .success();
    write_request(&dir, "REQ-1", "DEMO");
    aperture(&dir)
        .args(["schedule", "create", "REQ-1"])
        .assert()
        .success();
    wait_for_status(&dir, "create", "REQ-1", "succeeded");
    aperture(&dir)
        .args(["config", "get", "projects"])
        .assert()
        .success()
        .stdout(predicate::str::contains("DEMO"));

    aperture(&dir)
        .args(["schedule", "remove", "DEMO", "--by", "alice"])
        .assert()
        .success();
    wait_for_status(&dir, "remove", "DEMO", "succeeded");
    aperture(&dir)
        .args(["config", "get", "link.wiki"])
        .assert()
        .success()
        .stdout("memory://\n");
}
