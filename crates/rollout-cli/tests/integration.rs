#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

fn rollout(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("rollout").unwrap();
    cmd.current_dir(dir.path()).env("ROLLOUT_ROOT", dir.path());
    cmd
}

const CONFIG: &str = r#"
version: 1
orchestrator:
  dispatch_timeout_seconds: 60
dispatch:
  default_command: echo "deployed $ROLLOUT_TARGET $ROLLOUT_RELEASE_NUMBER"
  environments:
    broken: echo "disk full" >&2; exit 4
    checked: test "$ROLLOUT_PARAM_REGION" = eu-west
"#;

const DEFINITIONS: &str = r#"
environments:
  - { id: 1, name: dev, customer_id: 1 }
  - { id: 2, name: staging, customer_id: 1, requires_approval: true }
  - { id: 3, name: prod, customer_id: 1 }
  - { id: 4, name: broken, customer_id: 1 }
  - { id: 5, name: checked, customer_id: 1 }
releases:
  - id: 1
    name: web
    version: "1.0"
    customer_id: 1
    targets:
      stages:
        - { id: 1, environment_id: 1, order_index: 0 }
        - { id: 2, environment_id: 2, order_index: 1 }
        - { id: 3, environment_id: 3, order_index: 2 }
  - id: 2
    name: api
    version: "2.0"
    customer_id: 1
    targets:
      stages:
        - { id: 4, environment_id: 1, order_index: 0 }
        - { id: 5, environment_id: 4, order_index: 0 }
        - { id: 6, environment_id: 3, order_index: 1 }
  - id: 3
    name: jobs
    version: "0.3"
    customer_id: 1
    targets:
      pipelines:
        - { id: 1, pipeline_id: 30, pipeline_name: build, order_index: 0, execution_mode: parallel }
        - { id: 2, pipeline_id: 31, pipeline_name: test, order_index: 0, execution_mode: parallel }
        - { id: 3, pipeline_id: 32, pipeline_name: publish, order_index: 1 }
  - id: 4
    name: params
    version: "1.1"
    customer_id: 1
    targets:
      stages:
        - { id: 7, environment_id: 5, order_index: 0 }
"#;

fn setup() -> TempDir {
    let dir = TempDir::new().unwrap();
    rollout(&dir).arg("init").assert().success();
    std::fs::write(dir.path().join(".rollout/config.yaml"), CONFIG).unwrap();
    std::fs::write(dir.path().join(".rollout/definitions.yaml"), DEFINITIONS).unwrap();
    dir
}

fn json_of(cmd: &mut Command) -> Value {
    let output = cmd.arg("--json").output().unwrap();
    serde_json::from_slice(&output.stdout).unwrap()
}

fn deploy(dir: &TempDir, release: &str) -> Value {
    json_of(rollout(dir).args(["deploy", "--release", release, "--customer", "1"]))
}

// ---------------------------------------------------------------------------
// init / validate
// ---------------------------------------------------------------------------

#[test]
fn init_creates_rollout_dir() {
    let dir = TempDir::new().unwrap();
    rollout(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .rollout/config.yaml"));

    assert!(dir.path().join(".rollout/config.yaml").exists());
    assert!(dir.path().join(".rollout/definitions.yaml").exists());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    rollout(&dir).arg("init").assert().success();
    rollout(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .rollout/definitions.yaml"));
}

#[test]
fn commands_before_init_fail() {
    let dir = TempDir::new().unwrap();
    rollout(&dir)
        .args(["list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("rollout init"));
}

#[test]
fn validate_accepts_well_formed_definitions() {
    let dir = setup();
    rollout(&dir)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("5 environment(s), 4 release(s)"));
}

#[test]
fn validate_fails_on_unknown_environment() {
    let dir = setup();
    let broken = DEFINITIONS.replace("environment_id: 3, order_index: 2", "environment_id: 99, order_index: 2");
    std::fs::write(dir.path().join(".rollout/definitions.yaml"), broken).unwrap();

    rollout(&dir)
        .arg("validate")
        .assert()
        .failure()
        .stdout(predicate::str::contains("unknown environment 99"));
}

// ---------------------------------------------------------------------------
// plan
// ---------------------------------------------------------------------------

#[test]
fn plan_groups_parallel_members() {
    let dir = setup();
    let plan = json_of(rollout(&dir).args(["plan", "--release", "3", "--customer", "1"]));
    let units = plan["units"].as_array().unwrap();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0]["type"], "parallel");
    assert_eq!(units[0]["members"].as_array().unwrap().len(), 2);
    assert_eq!(units[1]["type"], "sequential");
}

#[test]
fn plan_table_shows_gates() {
    let dir = setup();
    rollout(&dir)
        .args(["plan", "--release", "1", "--customer", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("staging"))
        .stdout(predicate::str::contains("pre"));
}

#[test]
fn plan_is_customer_scoped() {
    let dir = setup();
    rollout(&dir)
        .args(["plan", "--release", "1", "--customer", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("release not found: 1"));
}

// ---------------------------------------------------------------------------
// deploy / approve / reject
// ---------------------------------------------------------------------------

#[test]
fn deploy_pauses_at_gate_then_approve_completes() {
    let dir = setup();
    let exec = deploy(&dir, "1");
    assert_eq!(exec["status"], "in_progress");
    assert_eq!(exec["release_number"], "1.0-1");
    assert_eq!(exec["stages"][0]["status"], "succeeded");
    assert_eq!(exec["stages"][0]["output"], "deployed dev 1.0-1");
    assert_eq!(exec["stages"][1]["status"], "awaiting_approval");
    assert_eq!(exec["stages"][2]["status"], "pending");

    let id = exec["id"].as_str().unwrap();
    let stage = exec["stages"][1]["id"].as_str().unwrap();
    let exec = json_of(rollout(&dir).args(["approve", id, stage, "--by", "alice"]));
    assert_eq!(exec["status"], "succeeded");
    assert_eq!(exec["stages"][1]["approved_by"], "alice");
    assert_eq!(exec["stages"][2]["status"], "succeeded");
}

#[test]
fn reject_fails_execution() {
    let dir = setup();
    let exec = deploy(&dir, "1");
    let id = exec["id"].as_str().unwrap();
    let stage = exec["stages"][1]["id"].as_str().unwrap();

    rollout(&dir)
        .args(["reject", id, stage, "--by", "bob", "--comment", "freeze"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("freeze"));

    let exec = json_of(rollout(&dir).args(["status", id]));
    assert_eq!(exec["status"], "failed");
    assert_eq!(exec["stages"][2]["status"], "skipped");
}

#[test]
fn failing_command_fails_parallel_unit() {
    let dir = setup();
    let exec = deploy(&dir, "2");
    assert_eq!(exec["status"], "failed");
    assert_eq!(exec["stages"][0]["status"], "succeeded");
    assert_eq!(exec["stages"][1]["status"], "failed");
    assert_eq!(exec["stages"][1]["error"], "command failed: exit status 4: disk full");
    assert_eq!(exec["stages"][2]["status"], "skipped");
}

#[test]
fn pipeline_release_runs_to_completion() {
    let dir = setup();
    rollout(&dir)
        .args(["deploy", "--release", "3", "--customer", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("succeeded"))
        .stdout(predicate::str::contains("publish"));
}

#[test]
fn deploy_parameters_reach_the_command() {
    let dir = setup();
    rollout(&dir)
        .args(["deploy", "--release", "4", "--customer", "1", "--param", "region=eu-west"])
        .assert()
        .success();
    rollout(&dir)
        .args(["deploy", "--release", "4", "--customer", "1", "--param", "region=us-east"])
        .assert()
        .failure();
}

#[test]
fn malformed_param_is_rejected_by_clap() {
    let dir = setup();
    rollout(&dir)
        .args(["deploy", "--release", "4", "--customer", "1", "--param", "region"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("KEY=VALUE"));
}

// ---------------------------------------------------------------------------
// resume / cancel / status / list
// ---------------------------------------------------------------------------

#[test]
fn resume_keeps_gate_closed() {
    let dir = setup();
    let exec = deploy(&dir, "1");
    let id = exec["id"].as_str().unwrap();

    let resumed = json_of(rollout(&dir).args(["resume", id]));
    assert_eq!(resumed["stages"][0]["status"], "succeeded");
    assert_eq!(resumed["stages"][1]["status"], "awaiting_approval");
}

#[test]
fn cancel_held_execution() {
    let dir = setup();
    let exec = deploy(&dir, "1");
    let id = exec["id"].as_str().unwrap();

    let cancelled = json_of(rollout(&dir).args(["cancel", id]));
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(cancelled["stages"][1]["status"], "skipped");
    assert_eq!(cancelled["stages"][2]["status"], "skipped");

    rollout(&dir)
        .args(["cancel", id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already finished"));
}

#[cfg(unix)]
#[test]
fn interrupted_deploy_is_cancelled() {
    let dir = setup();
    let config = CONFIG.replace(
        "default_command: echo \"deployed $ROLLOUT_TARGET $ROLLOUT_RELEASE_NUMBER\"",
        "default_command: touch started && exec sleep 30",
    );
    std::fs::write(dir.path().join(".rollout/config.yaml"), config).unwrap();

    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("rollout"))
        .args(["deploy", "--release", "1", "--customer", "1", "--json"])
        .current_dir(dir.path())
        .env("ROLLOUT_ROOT", dir.path())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .unwrap();

    let started = dir.path().join("started");
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(20);
    while !started.exists() {
        assert!(std::time::Instant::now() < deadline, "deploy command never started");
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    let sent = std::process::Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(sent.success());

    let output = child.wait_with_output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("was cancelled"));

    let exec: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(exec["status"], "cancelled");
    assert_eq!(exec["stages"][0]["status"], "failed");
    assert_eq!(exec["stages"][0]["error"], "dispatch cancelled");
    assert_eq!(exec["stages"][1]["status"], "skipped");

    // the db lock is released and the record is final
    let id = exec["id"].as_str().unwrap();
    let stored = json_of(rollout(&dir).args(["status", id]));
    assert_eq!(stored["status"], "cancelled");
}

#[test]
fn status_of_unknown_execution_fails() {
    let dir = setup();
    rollout(&dir)
        .args(["status", "6f1c1a52-8d44-4b43-9a53-6a7d3f2e9b10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("release execution not found"));
}

#[test]
fn list_filters_by_release() {
    let dir = setup();
    deploy(&dir, "1");
    deploy(&dir, "1");
    deploy(&dir, "3");

    let all = json_of(rollout(&dir).arg("list"));
    assert_eq!(all.as_array().unwrap().len(), 3);

    let web = json_of(rollout(&dir).args(["list", "--release", "1"]));
    let numbers: Vec<&str> = web
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["release_number"].as_str().unwrap())
        .collect();
    assert_eq!(numbers.len(), 2);
    assert!(numbers.contains(&"1.0-1"));
    assert!(numbers.contains(&"1.0-2"));

    rollout(&dir)
        .args(["list", "--release", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("jobs"));
}
