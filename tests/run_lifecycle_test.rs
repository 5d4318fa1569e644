//! End-to-end runs through `ScriptRunner`.
//!
//! Tests that need a real server use `python3 -m http.server` as the
//! back-end and return early when python3 is not installed.

use script_runner::error::StepErrorKind;
use script_runner::instance::{InstanceMetadata, InstanceReaper};
use script_runner::runner::{Manifest, RunState, RunStatus, RunnerOptions, ScriptRunner};
use script_runner::Script;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn python_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn runner(root: &Path) -> ScriptRunner {
    ScriptRunner::new(RunnerOptions {
        runs_root: root.join("runs"),
        instances_root: root.join("instances"),
    })
    .expect("builtin handlers register")
}

fn script(value: serde_json::Value) -> Script {
    serde_json::from_value(value).expect("valid script document")
}

fn temp_instance_script(name: &str, auto_cleanup: bool) -> Script {
    script(json!({
        "script_name": name,
        "settings": {
            "use_temp_instance": true,
            "auto_cleanup": auto_cleanup,
            "instance": {
                "readiness_timeout": "20s",
                "probe_interval": "200ms",
                "grace_period": "2s"
            }
        },
        "steps": [
            {"id": "create", "type": "instance", "action": "create_temp_instance"},
            {"id": "bogus", "type": "bogus", "action": "nope"}
        ]
    }))
}

fn instance_dir(manifest: &Manifest) -> PathBuf {
    PathBuf::from(
        manifest.steps[0].data["instance_dir"]
            .as_str()
            .expect("create step reports instance_dir"),
    )
}

#[tokio::test]
async fn test_unregistered_step_aborts_and_cleans_up() {
    if !python_available() {
        eprintln!("Skipping: python3 not available");
        return;
    }
    let root = TempDir::new().unwrap();
    let outcome = runner(root.path())
        .run(&temp_instance_script("e2e cleanup", true))
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Aborted);
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.steps.len(), 2);
    assert!(outcome.steps[0].success, "{:?}", outcome.steps[0].error);
    assert!(!outcome.steps[1].success);
    assert_eq!(
        outcome.steps[1].error.as_ref().unwrap().kind,
        StepErrorKind::HandlerNotFound
    );

    let manifest = Manifest::load(&outcome.manifest_path).unwrap();
    let dir = instance_dir(&manifest);
    assert!(!dir.exists(), "working directory should be removed");
    assert!(outcome.session_dir.join("logs/backend.log").is_file());
    assert!(manifest.session_variables.contains_key("base_url"));
    assert!(manifest.first_error.unwrap().contains("bogus"));
}

#[tokio::test]
async fn test_instance_left_running_can_be_reused_then_reaped() {
    if !python_available() {
        eprintln!("Skipping: python3 not available");
        return;
    }
    let root = TempDir::new().unwrap();
    let first = runner(root.path())
        .run(&temp_instance_script("e2e keep", false))
        .await
        .unwrap();
    assert_eq!(first.state, RunState::Aborted);

    let manifest = Manifest::load(&first.manifest_path).unwrap();
    let dir = instance_dir(&manifest);
    assert!(dir.is_dir(), "working directory must survive auto_cleanup=false");

    let metadata = InstanceMetadata::load(&dir.join("instance.json")).unwrap();
    assert!(!metadata.auto_cleanup);
    assert_eq!(
        manifest.steps[0].data["base_url"].as_str().unwrap(),
        metadata.base_url
    );
    assert_eq!(
        manifest.steps[0].data["back_port"].as_str().unwrap(),
        metadata.back_port.to_string()
    );
    assert!(!metadata.processes.is_empty());

    // A later run reconnects by id and talks to the same server.
    let second = runner(root.path())
        .run(&script(json!({
            "script_name": "e2e reuse",
            "settings": {
                "use_existing_instance": true,
                "existing_instance_id": metadata.instance_id
            },
            "steps": [
                {"id": "ping", "type": "command", "action": "api_test",
                 "config": {"url": "{{api_url}}/", "expected_status": 200}}
            ]
        })))
        .await
        .unwrap();
    assert!(second.is_completed(), "{:?}", second.first_error);
    assert!(dir.is_dir(), "existing instances are never removed by a run");

    let reports = InstanceReaper::new(root.path().join("instances"))
        .with_grace(Duration::from_secs(2))
        .clean(&[metadata.instance_id.clone()])
        .await
        .unwrap();
    assert!(reports[0].errors.is_empty(), "{:?}", reports[0].errors);
    assert!(reports[0].removed_dir);
    assert!(!dir.exists());
}

#[tokio::test]
async fn test_readiness_timeout_is_bounded_and_captures_logs() {
    let root = TempDir::new().unwrap();
    let started = Instant::now();
    let outcome = runner(root.path())
        .run(&script(json!({
            "script_name": "never ready",
            "settings": {
                "use_temp_instance": true,
                "instance": {
                    "backend_command": "echo 'starting without a port'; sleep 60",
                    "readiness_timeout": "1s",
                    "probe_interval": "100ms",
                    "grace_period": "1s"
                }
            },
            "steps": [
                {"id": "create", "type": "instance", "action": "create_temp_instance"},
                {"id": "after", "type": "test", "action": "set_session_variables",
                 "config": {"variables": {"x": "1"}}}
            ]
        })))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(outcome.state, RunState::Aborted);
    assert_eq!(outcome.steps.len(), 1);
    assert_eq!(
        outcome.steps[0].error.as_ref().unwrap().kind,
        StepErrorKind::ReadinessTimeout
    );

    let manifest = Manifest::load(&outcome.manifest_path).unwrap();
    assert!(!manifest.log_tails.is_empty());
    assert!(manifest
        .log_tails
        .values()
        .flatten()
        .any(|line| line.contains("starting without a port")));
    assert!(manifest.instance.as_ref().unwrap()["instance_id"].is_string());

    // Auto cleanup still removed the failed instance.
    let instances = root.path().join("instances");
    let leftovers = std::fs::read_dir(&instances)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_lazy_temp_instance_before_first_regular_step() {
    let root = TempDir::new().unwrap();
    let outcome = runner(root.path())
        .run(&script(json!({
            "script_name": "lazy",
            "settings": {
                "use_temp_instance": true,
                "instance": {
                    "backend_command": "exit 7",
                    "readiness_timeout": "5s",
                    "probe_interval": "100ms"
                }
            },
            "steps": [
                {"id": "first", "type": "test", "action": "set_session_variables",
                 "continue_on_error": true,
                 "config": {"variables": {"x": "1"}}},
                {"id": "second", "type": "test", "action": "set_session_variables",
                 "config": {"variables": {"y": "2"}}}
            ]
        })))
        .await
        .unwrap();

    // Instance start-up failure aborts the run even with continue_on_error.
    assert_eq!(outcome.state, RunState::Aborted);
    assert_eq!(outcome.steps.len(), 1);
    assert_eq!(
        outcome.steps[0].error.as_ref().unwrap().kind,
        StepErrorKind::Provisioning
    );
}

#[tokio::test]
async fn test_zero_steps_completes_with_empty_log() {
    let root = TempDir::new().unwrap();
    let outcome = runner(root.path())
        .run(&script(json!({"script_name": "nothing", "steps": []})))
        .await
        .unwrap();
    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.status, RunStatus::Success);
    assert!(outcome.steps.is_empty());
    let manifest = Manifest::load(&outcome.manifest_path).unwrap();
    assert!(manifest.steps.is_empty());
    assert!(outcome.session_dir.join("screenshots").is_dir());
}

#[tokio::test]
async fn test_continue_on_error_runs_next_step() {
    let root = TempDir::new().unwrap();
    let outcome = runner(root.path())
        .run(&script(json!({
            "script_name": "keep going",
            "steps": [
                {"id": "fails", "type": "command", "action": "run_command",
                 "continue_on_error": true, "config": {"command": "exit 1"}},
                {"id": "runs", "type": "command", "action": "run_command",
                 "config": {"command": "echo still here", "capture_as": "msg"}}
            ]
        })))
        .await
        .unwrap();
    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.status, RunStatus::Partial);
    assert!(outcome.steps[1].success);
    let manifest = Manifest::load(&outcome.manifest_path).unwrap();
    assert_eq!(manifest.session_variables["msg"].value, "still here");
}

#[tokio::test]
async fn test_failure_without_continue_stops_dispatch() {
    let root = TempDir::new().unwrap();
    let marker = root.path().join("should-not-exist");
    let outcome = runner(root.path())
        .run(&script(json!({
            "script_name": "stop here",
            "steps": [
                {"id": "fails", "type": "command", "action": "run_command",
                 "config": {"command": "exit 1"}},
                {"id": "never", "type": "command", "action": "run_command",
                 "config": {"command": format!("touch {}", marker.display())}}
            ]
        })))
        .await
        .unwrap();
    assert_eq!(outcome.state, RunState::Aborted);
    assert_eq!(outcome.steps.len(), 1);
    assert!(!marker.exists());
    assert!(outcome.manifest_path.is_file());
}

#[tokio::test]
async fn test_run_file_loads_from_disk() {
    let root = TempDir::new().unwrap();
    let path = root.path().join("script.json");
    std::fs::write(
        &path,
        r#"{"script_name": "from disk", "steps": [
            {"id": "set", "type": "test", "action": "set_session_variables",
             "config": {"variables": {"stamp": "{{$random_hex:6}}"}}}
        ]}"#,
    )
    .unwrap();
    let outcome = runner(root.path()).run_file(&path).await.unwrap();
    assert!(outcome.is_completed());
    let manifest = Manifest::load(&outcome.manifest_path).unwrap();
    let stamp = &manifest.session_variables["stamp"].value;
    assert_eq!(stamp.len(), 6);
    assert!(stamp.chars().all(|c| c.is_ascii_hexdigit()));
}
