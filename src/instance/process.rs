//! Spawning and terminating instance server processes.
//!
//! Each server runs as `bash -c "<command>"` in its own process group
//! with stdout and stderr appended to files under the instance's `logs/`
//! directory. Termination signals the whole group so shells and their
//! children go down together.

use crate::error::{validate_pid, validate_pid_start_time, Error, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerRole {
    Backend,
    Frontend,
}

impl ServerRole {
    pub fn name(&self) -> &'static str {
        match self {
            ServerRole::Backend => "backend",
            ServerRole::Frontend => "frontend",
        }
    }
}

/// Log files for one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LogPaths {
    pub fn for_role(logs_dir: &Path, role: ServerRole) -> Self {
        Self {
            stdout: logs_dir.join(format!("{}.log", role.name())),
            stderr: logs_dir.join(format!("{}.err.log", role.name())),
        }
    }
}

/// A spawned server owned by the supervisor.
#[derive(Debug)]
pub struct ServerProcess {
    role: ServerRole,
    child: Child,
    pid: u32,
    started_at: DateTime<Utc>,
    logs: LogPaths,
}

impl ServerProcess {
    pub fn spawn(
        role: ServerRole,
        command: &str,
        work_dir: &Path,
        environment: &HashMap<String, String>,
        logs: LogPaths,
    ) -> Result<Self> {
        let spawn_err = |reason: String| Error::ProcessSpawn {
            name: role.name().to_string(),
            reason,
        };

        let open = |path: &Path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| spawn_err(format!("cannot open log {}: {}", path.display(), e)))
        };
        let stdout = open(&logs.stdout)?;
        let stderr = open(&logs.stderr)?;

        tracing::debug!(
            role = role.name(),
            work_dir = %work_dir.display(),
            command,
            "Spawning server process"
        );

        let mut cmd = Command::new("/bin/bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(work_dir)
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            // Dropping the handle must leave the server running for auto_cleanup=false.
            .kill_on_drop(false)
            .process_group(0);

        let child = cmd.spawn().map_err(|e| {
            tracing::error!(role = role.name(), error = %e, "Failed to spawn server");
            spawn_err(e.to_string())
        })?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_err("process exited before its PID was read".to_string()))?;
        validate_pid(pid, role.name())?;

        Ok(Self {
            role,
            child,
            pid,
            started_at: Utc::now(),
            logs,
        })
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn logs(&self) -> &LogPaths {
        &self.logs
    }

    /// Exit status if the process has already exited.
    pub fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }

    /// SIGTERM the process group, wait up to `grace`, then SIGKILL.
    ///
    /// The group is signalled even when the `bash -c` leader has already
    /// exited: anything it backgrounded still holds the group.
    #[tracing::instrument(skip(self), fields(role = self.role.name(), pid = self.pid))]
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        // Spawned with process_group(0), so the group id is the leader's PID.
        let pgid = validate_pid(self.pid, self.role.name())?;

        match killpg(pgid, Signal::SIGTERM) {
            Err(Errno::ESRCH) => {
                self.reap();
                tracing::debug!("Process group already gone before SIGTERM");
                return Ok(());
            }
            Err(e) => {
                tracing::debug!("killpg failed ({}), signalling the leader only", e);
                let _ = signal::kill(pgid, Signal::SIGTERM);
            }
            Ok(()) => {}
        }

        if self.wait_for_group(pgid, grace).await {
            tracing::debug!("Server exited gracefully");
            return Ok(());
        }

        tracing::warn!(
            "Server did not exit after SIGTERM (grace period: {:?}), sending SIGKILL",
            grace
        );
        force_kill(pgid);
        if !self.wait_for_group(pgid, KILL_WAIT).await {
            tracing::warn!("Process group {} still present after SIGKILL", pgid);
        }
        Ok(())
    }

    fn reap(&mut self) {
        let _ = self.child.try_wait();
    }

    /// Poll until the group is empty, reaping the leader once it exits.
    async fn wait_for_group(&mut self, pgid: Pid, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            self.reap();
            if !group_alive(pgid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
    }
}

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Whether any process (zombies included) is left in group `pgid`.
fn group_alive(pgid: Pid) -> bool {
    !matches!(killpg(pgid, None), Err(Errno::ESRCH))
}

/// Whether the process group a server was spawned into still has members.
pub fn recorded_group_alive(pid: u32) -> bool {
    crate::error::validate_pid_for_check(pid).is_some_and(group_alive)
}

fn force_kill(pgid: Pid) {
    if killpg(pgid, Signal::SIGKILL).is_err() {
        let _ = signal::kill(pgid, Signal::SIGKILL);
    }
}

async fn wait_for_recorded_group(pgid: Pid, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if !group_alive(pgid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(GROUP_POLL_INTERVAL).await;
    }
}

/// Terminate a server we hold no handle for, identified by its recorded PID.
///
/// The recorded PID is also the server's process group id. A live leader
/// must still match its recorded start time and lead its own group. Once
/// the leader is gone, the group it left behind is signalled directly: the
/// kernel does not hand out a PID again while a group still uses it as id.
/// Returns whether a signal was delivered.
pub async fn terminate_recorded_pid(
    pid: u32,
    name: &str,
    started_at: Option<DateTime<Utc>>,
    grace: Duration,
) -> Result<bool> {
    let pgid = validate_pid(pid, name)?;
    if signal::kill(pgid, None).is_ok() {
        if let Some(expected) = started_at {
            if !validate_pid_start_time(pid, expected) {
                tracing::warn!("PID {} for '{}' was reused by another process, skipping", pid, name);
                return Ok(false);
            }
        }
        if process_group(pid).is_some_and(|group| group != pgid) {
            tracing::warn!("PID {} for '{}' no longer leads its process group, skipping", pid, name);
            return Ok(false);
        }
    }

    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(false),
        Err(e) => {
            tracing::warn!("Failed to signal process group {} for '{}': {}", pid, name, e);
            return Ok(false);
        }
    }

    if wait_for_recorded_group(pgid, grace).await {
        return Ok(true);
    }

    tracing::warn!(
        "Process group {} ('{}') did not exit after SIGTERM (grace period: {:?}), sending SIGKILL",
        pid,
        name,
        grace
    );
    force_kill(pgid);
    if !wait_for_recorded_group(pgid, KILL_WAIT).await {
        tracing::debug!("Process group {} still listed after SIGKILL (unreaped zombies)", pid);
    }
    Ok(true)
}

fn process_group(pid: u32) -> Option<Pid> {
    let nix_pid = crate::error::validate_pid_for_check(pid)?;
    match nix::unistd::getpgid(Some(nix_pid)) {
        Ok(pgid) if pgid.as_raw() > 0 => Some(pgid),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("Failed to get PGID for PID {}: {}", pid, e);
            None
        }
    }
}

/// Captured result of a one-shot shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `command` through `bash -c` and capture its output. A command still
/// running at `timeout` is killed and reported as an error.
pub async fn run_shell_command(
    command: &str,
    work_dir: Option<&Path>,
    environment: &HashMap<String, String>,
    timeout: Duration,
) -> Result<CommandOutput> {
    let mut cmd = Command::new("/bin/bash");
    cmd.arg("-c")
        .arg(command)
        .envs(environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = work_dir {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|e| Error::ProcessSpawn {
        name: command.to_string(),
        reason: e.to_string(),
    })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(Error::HandlerExecution(format!(
            "failed to wait for '{}': {}",
            command, e
        ))),
        Err(_) => Err(Error::HandlerExecution(format!(
            "command timed out after {:?}: {}",
            timeout, command
        ))),
    }
}
