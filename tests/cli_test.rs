//! Smoke tests for the `srun` binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn srun_binary() -> String {
    env!("CARGO_BIN_EXE_srun").to_string()
}

fn srun(dir: &Path, args: &[&str]) -> Output {
    Command::new(srun_binary())
        .current_dir(dir)
        .env_remove("SRUN_RUNS_DIR")
        .env_remove("SRUN_INSTANCES_DIR")
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("Failed to execute srun")
}

fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, body).expect("Failed to write script");
    path
}

const VALID_SCRIPT: &str = r#"{
    "script_name": "cli smoke",
    "steps": [
        {"id": "greet", "type": "test", "action": "set_session_variables",
         "config": {"variables": {"greeting": "hello"}}},
        {"id": "check", "type": "test", "action": "verify_session_variable",
         "config": {"variable": "greeting", "expected_value": "hello"}}
    ]
}"#;

#[test]
fn test_help_flag() {
    let dir = TempDir::new().unwrap();
    let output = srun(dir.path(), &["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["run", "validate", "instances", "completions"] {
        assert!(stdout.contains(subcommand), "help should list '{}'", subcommand);
    }
}

#[test]
fn test_validate_valid_script() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "ok.json", VALID_SCRIPT);
    let output = srun(dir.path(), &["validate", script.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Script is valid"));
    assert!(stdout.contains("Steps: 2"));
}

#[test]
fn test_validate_rejects_duplicate_ids() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        &dir,
        "dup.json",
        r#"{"script_name": "dup", "steps": [
            {"id": "a", "type": "test", "action": "set_session_variables"},
            {"id": "a", "type": "test", "action": "set_session_variables"}
        ]}"#,
    );
    let output = srun(dir.path(), &["validate", script.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_validate_rejects_malformed_json() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "broken.json", "{ not json");
    let output = srun(dir.path(), &["validate", script.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_run_writes_session_under_runs_dir() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "ok.json", VALID_SCRIPT);
    let runs = dir.path().join("my-runs");
    let output = srun(
        dir.path(),
        &[
            "run",
            script.to_str().unwrap(),
            "--runs-dir",
            runs.to_str().unwrap(),
        ],
    );
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let sessions: Vec<_> = fs::read_dir(&runs)
        .expect("runs directory created")
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(sessions.len(), 1);
    let session = sessions[0].path();
    assert!(session
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("cli_smoke_"));

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(session.join("manifest.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["status"], "success");
    assert_eq!(manifest["steps"].as_array().unwrap().len(), 2);
    assert_eq!(manifest["session_variables"]["greeting"]["value"], "hello");
}

#[test]
fn test_run_failing_script_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        &dir,
        "fail.json",
        r#"{"script_name": "fails", "steps": [
            {"id": "boom", "type": "command", "action": "run_command",
             "config": {"command": "exit 3"}}
        ]}"#,
    );
    let output = srun(dir.path(), &["run", script.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(dir.path().join("runs").is_dir());
}

#[test]
fn test_instances_list_json_empty() {
    let dir = TempDir::new().unwrap();
    let instances = dir.path().join("instances");
    fs::create_dir_all(&instances).unwrap();
    let output = srun(
        dir.path(),
        &[
            "instances",
            "list",
            "--json",
            "--instances-dir",
            instances.to_str().unwrap(),
        ],
    );
    assert!(output.status.success());
    let listed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("list --json prints JSON");
    assert_eq!(listed, serde_json::json!([]));
}

#[test]
fn test_instances_clean_requires_target() {
    let dir = TempDir::new().unwrap();
    let output = srun(dir.path(), &["instances", "clean"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--all"));
}

#[test]
fn test_completions_bash() {
    let dir = TempDir::new().unwrap();
    let output = srun(dir.path(), &["completions", "bash"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("srun"));
}
