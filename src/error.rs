// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Failed to load script '{path}': {reason}")]
    #[diagnostic(
        code(srun::script::load),
        help("Check that the file exists and contains a JSON object with `script_name` and `steps`")
    )]
    ScriptLoad { path: String, reason: String },

    #[error("Script validation failed:\n{}", .0.iter().map(|p| format!("  - {}", p)).collect::<Vec<_>>().join("\n"))]
    #[diagnostic(
        code(srun::script::validation),
        help("Run `srun validate <script>` to see every problem at once")
    )]
    ScriptValidation(Vec<String>),

    #[error("No handler registered for step type '{category}' action '{action}'")]
    #[diagnostic(code(srun::dispatch::handler_not_found))]
    HandlerNotFound { category: String, action: String },

    #[error("Handler for '{category}/{action}' is already registered")]
    DuplicateHandler { category: String, action: String },

    #[error("Provisioning failed: {0}")]
    #[diagnostic(
        code(srun::instance::provisioning),
        help("Check that the instances directory is writable and `source_dir` exists")
    )]
    Provisioning(String),

    #[error("Port allocation failed: {0}")]
    #[diagnostic(
        code(srun::port::allocation_failed),
        help("Widen `settings.instance.port_range` or free ports in the configured range")
    )]
    PortAllocation(String),

    #[error("Instance '{instance}' was not ready after {timeout:?}")]
    #[diagnostic(
        code(srun::instance::readiness_timeout),
        help("Inspect the captured log tails in the run manifest or raise `readiness_timeout`")
    )]
    ReadinessTimeout {
        instance: String,
        timeout: Duration,
        log_tail: String,
    },

    #[error("Process '{name}' exited during startup ({status})")]
    #[diagnostic(code(srun::instance::process_exited))]
    ProcessExited {
        name: String,
        status: String,
        log_tail: String,
    },

    #[error("Failed to spawn '{name}': {reason}")]
    #[diagnostic(
        code(srun::process::spawn),
        help("Check that the command exists and is executable")
    )]
    ProcessSpawn { name: String, reason: String },

    #[error("{0}")]
    HandlerExecution(String),

    #[error("No instance available: {0}")]
    #[diagnostic(
        code(srun::instance::unavailable),
        help("Set `use_temp_instance` or `use_existing_instance` in the script settings")
    )]
    InstanceUnavailable(String),

    #[error("Cannot {operation} an instance in state '{state}'")]
    InvalidInstanceState { operation: String, state: String },

    #[error("Invalid condition '{expression}': {reason}")]
    Condition { expression: String, reason: String },

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failed step as recorded in the run manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    HandlerNotFound,
    HandlerExecution,
    Provisioning,
    ReadinessTimeout,
    InstanceUnavailable,
    Condition,
}

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::ScriptLoad { .. } | Error::ScriptValidation(_) => {
                Some("Validate the script with: srun validate <script>".to_string())
            }
            Error::HandlerNotFound { category, action } => Some(format!(
                "'{}/{}' is not a built-in action. Check the step's `type` and `action` spelling.",
                category, action
            )),
            Error::PortAllocation(_) => Some(
                "Another run may be holding the range. Retry, or set a wider `port_range`."
                    .to_string(),
            ),
            Error::ReadinessTimeout { log_tail, .. } | Error::ProcessExited { log_tail, .. }
                if !log_tail.is_empty() =>
            {
                Some(format!("Last log lines:\n{}", log_tail))
            }
            Error::InstanceUnavailable(_) => Some(
                "Enable `use_temp_instance` or `use_existing_instance` in `settings`.".to_string(),
            ),
            Error::ProcessSpawn { .. } => {
                Some("Check that the command exists and is executable".to_string())
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }

    /// Maps an error surfaced while executing a step onto its manifest kind.
    pub fn step_error_kind(&self) -> StepErrorKind {
        match self {
            Error::HandlerNotFound { .. } => StepErrorKind::HandlerNotFound,
            Error::Provisioning(_)
            | Error::PortAllocation(_)
            | Error::ProcessSpawn { .. }
            | Error::ProcessExited { .. } => StepErrorKind::Provisioning,
            Error::ReadinessTimeout { .. } => StepErrorKind::ReadinessTimeout,
            Error::InstanceUnavailable(_) | Error::InvalidInstanceState { .. } => {
                StepErrorKind::InstanceUnavailable
            }
            Error::Condition { .. } => StepErrorKind::Condition,
            _ => StepErrorKind::HandlerExecution,
        }
    }
}

/// Validates and converts a u32 PID to nix::unistd::Pid safely.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
pub fn validate_pid(pid: u32, owner: &str) -> Result<nix::unistd::Pid> {
    let reason = match pid {
        0 => Some(format!(
            "PID 0 is invalid for '{}' (refers to process group, not a process)",
            owner
        )),
        1 => Some(format!("refusing to operate on PID 1 (init) for '{}'", owner)),
        p if p > i32::MAX as u32 => Some(format!(
            "PID {} exceeds i32::MAX for '{}', cannot convert safely",
            p, owner
        )),
        _ => None,
    };
    match reason {
        Some(reason) => Err(Error::InvalidPid { pid, reason }),
        None => Ok(nix::unistd::Pid::from_raw(pid as i32)),
    }
}

/// Same as validate_pid but allows PID 1, for read-only existence checks.
pub fn validate_pid_for_check(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(nix::unistd::Pid::from_raw(pid as i32))
}

/// Returns true if a process with this PID currently exists.
pub fn is_pid_alive(pid: u32) -> bool {
    validate_pid_for_check(pid)
        .map(|p| nix::sys::signal::kill(p, None).is_ok())
        .unwrap_or(false)
}

/// Check whether a PID still belongs to the process started at `expected_start`.
///
/// Returns false only when the PID was clearly reused by a different process;
/// when the start time cannot be determined the PID is trusted.
pub fn validate_pid_start_time(pid: u32, expected_start: chrono::DateTime<chrono::Utc>) -> bool {
    let expected_age = chrono::Utc::now().signed_duration_since(expected_start);
    if expected_age.num_hours() > 24 {
        return true;
    }

    match process_age_secs(pid) {
        Some(actual_age) => {
            let diff = (actual_age - expected_age.num_seconds() as f64).abs();
            if diff > 60.0 {
                tracing::warn!(
                    "PID {} appears to be reused: process age {:.0}s vs expected {:.0}s",
                    pid,
                    actual_age,
                    expected_age.num_seconds()
                );
                return false;
            }
            true
        }
        None => true,
    }
}

#[cfg(target_os = "linux")]
fn process_age_secs(pid: u32) -> Option<f64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name is parenthesized and may contain spaces.
    let close_paren = stat.rfind(')')?;
    let fields: Vec<&str> = stat.get(close_paren + 2..)?.split_whitespace().collect();
    let start_jiffies: f64 = fields.get(19)?.parse().ok()?;

    let uptime = std::fs::read_to_string("/proc/uptime").ok()?;
    let uptime_secs: f64 = uptime.split_whitespace().next()?.parse().ok()?;

    let ticks = nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .map(|v| v as f64)
        .unwrap_or(100.0);
    Some(uptime_secs - start_jiffies / ticks)
}

#[cfg(not(target_os = "linux"))]
fn process_age_secs(_pid: u32) -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_validate_pid_rejects_special_pids() {
        assert!(matches!(
            validate_pid(0, "backend"),
            Err(Error::InvalidPid { pid: 0, .. })
        ));
        assert!(matches!(
            validate_pid(1, "backend"),
            Err(Error::InvalidPid { pid: 1, .. })
        ));
        assert!(validate_pid(u32::MAX, "backend").is_err());
        assert!(validate_pid(4242, "backend").is_ok());
    }

    #[test]
    fn test_validate_pid_for_check_allows_init() {
        assert!(validate_pid_for_check(1).is_some());
        assert!(validate_pid_for_check(0).is_none());
    }

    #[test]
    fn test_own_pid_is_alive() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(0));
    }

    #[test]
    fn test_matching_start_time_returns_true() {
        assert!(validate_pid_start_time(std::process::id(), Utc::now()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_mismatched_start_time_returns_false() {
        // Our own process cannot have started a day-minus-an-hour ago.
        let long_ago = Utc::now() - chrono::Duration::hours(23);
        assert!(!validate_pid_start_time(std::process::id(), long_ago));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_age_uses_clock_ticks() {
        let age = process_age_secs(std::process::id()).unwrap();
        assert!((-1.0..3600.0).contains(&age), "age {age}");
        assert!(process_age_secs(u32::MAX).is_none());
    }

    #[test]
    fn test_step_error_kind_mapping() {
        let err = Error::HandlerNotFound {
            category: "bogus".into(),
            action: "nope".into(),
        };
        assert_eq!(err.step_error_kind(), StepErrorKind::HandlerNotFound);

        let err = Error::ReadinessTimeout {
            instance: "x".into(),
            timeout: Duration::from_secs(1),
            log_tail: String::new(),
        };
        assert_eq!(err.step_error_kind(), StepErrorKind::ReadinessTimeout);
        assert_eq!(
            Error::HandlerExecution("boom".into()).step_error_kind(),
            StepErrorKind::HandlerExecution
        );
    }

    #[test]
    fn test_validation_error_lists_every_problem() {
        let err = Error::ScriptValidation(vec!["a".into(), "b".into()]);
        let text = err.to_string();
        assert!(text.contains("  - a"));
        assert!(text.contains("  - b"));
        assert!(err.suggestion().is_some());
    }
}
