//! End-to-end tests of the `orchestra` binary against the digest demo

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::PathBuf;

fn demo(file: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../../demos/digest")
        .join(file)
}

fn orchestra() -> Command {
    let mut cmd = Command::cargo_bin("orchestra").unwrap();
    cmd.env("ORCHESTRA_LOG_LEVEL", "warn");
    cmd
}

#[test]
fn plan_prints_compiled_steps_without_running() {
    let output = orchestra()
        .args(["--output", "json", "plan", "--catalog"])
        .arg(demo("catalog.json"))
        .arg("--goal")
        .arg(demo("goal.json"))
        .output()
        .unwrap();
    assert!(output.status.success());

    let plan: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["status"], "compiled");
    let steps = plan["steps"].as_object().unwrap();
    let mut ids: Vec<&str> = steps.keys().map(String::as_str).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["fetch", "publish", "review", "summarize"]);
}

#[test]
fn run_completes_and_snapshot_can_be_inspected() {
    let dir = tempfile::tempdir().unwrap();

    let output = orchestra()
        .args(["--output", "json", "run", "--catalog"])
        .arg(demo("catalog.json"))
        .arg("--goal")
        .arg(demo("goal.json"))
        .arg("--snapshot-dir")
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["status"], "completed");
    assert_eq!(report["plan"]["steps"]["fetch"]["attempts"], 2);
    assert_eq!(report["plan"]["steps"]["summarize"]["template_id"], "summarize-lite");

    let snapshots: Vec<PathBuf> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    assert_eq!(snapshots.len(), 1);

    orchestra()
        .arg("inspect")
        .arg(&snapshots[0])
        .assert()
        .success()
        .stdout(predicate::str::contains("receipt"))
        .stdout(predicate::str::contains("summarize-lite"));
}

#[test]
fn failed_run_exits_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("catalog.json");
    std::fs::write(
        &catalog,
        r#"{
          "templates": [{
            "id": "fetch",
            "kind": {"type": "capability", "capability_id": "http.get"},
            "consumes": ["url"],
            "produces": ["document"]
          }],
          "capabilities": [{
            "id": "http.get",
            "retry_safe": true,
            "behavior": {"kind": "fail", "error": "fatal", "message": "host unreachable"}
          }]
        }"#,
    )
    .unwrap();
    let goal = dir.path().join("goal.json");
    std::fs::write(
        &goal,
        r#"{"id": "fetch-only", "targets": ["document"], "inputs": {"url": "https://example.com"}}"#,
    )
    .unwrap();

    orchestra()
        .args(["run", "--catalog"])
        .arg(&catalog)
        .arg("--goal")
        .arg(&goal)
        .assert()
        .failure()
        .stderr(predicate::str::contains("aborted"));
}

#[test]
fn resume_requires_snapshot_dir() {
    orchestra()
        .args(["run", "--catalog"])
        .arg(demo("catalog.json"))
        .args(["--resume", "plan-123"])
        .assert()
        .failure();
}
