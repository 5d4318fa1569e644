//! The on-disk record of one run.

use crate::dispatch::{Artifact, ArtifactKind, ArtifactSink, StepOutcome};
use crate::error::Result;
use crate::variables::{random_hex, SessionVariable, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Runner state machine:
/// `loading -> provisioning -> executing -> finalizing -> {completed, aborted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Loading,
    Provisioning,
    Executing,
    Finalizing,
    Completed,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Loading => "loading",
            RunState::Provisioning => "provisioning",
            RunState::Executing => "executing",
            RunState::Finalizing => "finalizing",
            RunState::Completed => "completed",
            RunState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Completed without a failed step.
    Success,
    /// Completed, but some `continue_on_error` steps failed.
    Partial,
    /// Aborted.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => f.write_str("success"),
            RunStatus::Partial => f.write_str("partial"),
            RunStatus::Failed => f.write_str("failed"),
        }
    }
}

/// The `manifest.json` document written at the end of every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub script_name: String,
    pub session_id: String,
    pub state: RunState,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub first_error: Option<String>,
    pub steps: Vec<StepOutcome>,
    pub artifacts: Vec<Artifact>,
    pub session_variables: BTreeMap<String, SessionVariable>,
    pub instance: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub log_tails: BTreeMap<String, Vec<String>>,
    pub script: Value,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Session directory plus the step log of a run in progress.
#[derive(Debug)]
pub struct RunSession {
    id: String,
    dir: PathBuf,
    started_at: DateTime<Utc>,
    outcomes: Vec<StepOutcome>,
    artifacts: ArtifactSink,
}

impl RunSession {
    /// Create `<runs_root>/<session_id>/` with its `screenshots/`, `logs/`
    /// and, when recording video, `videos/` directories.
    pub fn create(runs_root: &Path, sanitized_name: &str, video_recording: bool) -> Result<Self> {
        let id = format!(
            "{}_{}_{}",
            sanitized_name,
            chrono::Local::now().format("%Y%m%d_%H%M%S"),
            random_hex(4)
        );
        let dir = crate::instance::absolute_root(runs_root).join(&id);

        let artifacts = ArtifactSink::new(&dir, video_recording);
        std::fs::create_dir_all(artifacts.screenshots_dir())?;
        std::fs::create_dir_all(artifacts.logs_dir())?;
        if let Some(videos) = artifacts.videos_dir() {
            std::fs::create_dir_all(videos)?;
        }

        tracing::info!(session = %id, dir = %dir.display(), "Created run session");
        Ok(Self {
            id,
            dir,
            started_at: Utc::now(),
            outcomes: Vec::new(),
            artifacts,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn artifacts(&self) -> &ArtifactSink {
        &self.artifacts
    }

    pub fn outcomes(&self) -> &[StepOutcome] {
        &self.outcomes
    }

    pub fn record(&mut self, outcome: StepOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn has_failures(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.status == StepStatus::Failed)
    }

    /// Copy instance log files into the session's `logs/` directory.
    pub fn copy_logs(&self, files: &[(String, PathBuf)]) {
        let logs_dir = self.artifacts.logs_dir().to_path_buf();
        for (name, path) in files {
            let target = logs_dir.join(name);
            match std::fs::copy(path, &target) {
                Ok(_) => self.artifacts.record(ArtifactKind::Log, target, None),
                Err(e) => tracing::warn!(
                    file = %path.display(),
                    "Failed to copy instance log: {}",
                    e
                ),
            }
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<PathBuf> {
        let path = self.manifest_path();
        let json = serde_json::to_string_pretty(manifest)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}
