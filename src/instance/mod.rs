//! Ephemeral application instances.
//!
//! An instance is either a temporary deployment this run creates (its own
//! ports, working directory and server processes) or an existing one the run
//! merely points at. [`InstanceSupervisor`] owns the lifecycle:
//!
//! ```text
//! provisioning -> ready -> running -> stopping -> stopped
//!                    \________\___________________-> failed
//! ```

pub mod logs;
pub mod metadata;
pub mod process;
pub mod readiness;
pub mod reaper;
mod supervisor;
pub mod workspace;

pub use metadata::{InstanceMetadata, RecordedProcess};
pub use process::{CommandOutput, ServerRole};
pub use reaper::{InstanceReaper, InstanceSummary, ReapReport};
pub use supervisor::{InstanceSupervisor, ProvisionMode};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Provisioning,
    Ready,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    /// Created and owned by this run.
    Temp,
    /// Pointed at by URL or reconnected by id; never spawned or removed here.
    Existing,
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKind::Temp => f.write_str("temp"),
            InstanceKind::Existing => f.write_str("existing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub kind: InstanceKind,
    pub status: InstanceStatus,
    pub base_url: String,
    pub api_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub front_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub back_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub(crate) fn transition(&mut self, to: InstanceStatus) {
        if self.status != to {
            tracing::info!(instance = %self.id, from = %self.status, to = %to, "Instance state change");
            self.status = to;
        }
    }

    /// Session variables describing this instance.
    pub fn variables(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("base_url", self.base_url.clone()),
            ("api_url", self.api_url.clone()),
            ("instance_id", self.id.clone()),
        ];
        if let Some(port) = self.back_port {
            vars.push(("port", port.to_string()));
            vars.push(("back_port", port.to_string()));
        }
        if let Some(port) = self.front_port {
            vars.push(("front_port", port.to_string()));
        }
        if let Some(ref dir) = self.working_directory {
            vars.push(("instance_dir", dir.display().to_string()));
        }
        vars
    }
}

/// Resolve a possibly relative root against the current directory so
/// recorded paths stay valid from anywhere.
pub fn absolute_root(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
