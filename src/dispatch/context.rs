use super::StepOutcome;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceStatus, InstanceSupervisor};
use crate::variables::VariableStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Screenshot,
    Video,
    Log,
    Report,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

/// Output directories of a run plus the shared artifact record.
///
/// Cloning shares the record, so artifacts registered through any clone end
/// up in the same manifest.
#[derive(Debug, Clone)]
pub struct ArtifactSink {
    session_dir: PathBuf,
    screenshots_dir: PathBuf,
    videos_dir: Option<PathBuf>,
    logs_dir: PathBuf,
    records: Arc<Mutex<Vec<Artifact>>>,
}

impl ArtifactSink {
    /// Sink for `session_dir` with its `screenshots/`, `logs/` and, when
    /// recording video, `videos/` subdirectories. Creates nothing on disk.
    pub fn new(session_dir: impl Into<PathBuf>, video_recording: bool) -> Self {
        let session_dir = session_dir.into();
        Self {
            screenshots_dir: session_dir.join("screenshots"),
            videos_dir: video_recording.then(|| session_dir.join("videos")),
            logs_dir: session_dir.join("logs"),
            session_dir,
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn screenshots_dir(&self) -> &Path {
        &self.screenshots_dir
    }

    /// Present only when video recording is enabled.
    pub fn videos_dir(&self) -> Option<&Path> {
        self.videos_dir.as_deref()
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Conventional screenshot path: `NN_name.png` with a 1-based step number.
    pub fn screenshot_path(&self, step_number: usize, name: &str) -> PathBuf {
        let name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.screenshots_dir
            .join(format!("{:02}_{}.png", step_number, name))
    }

    pub fn record(&self, kind: ArtifactKind, path: impl Into<PathBuf>, step: Option<&str>) {
        self.records.lock().push(Artifact {
            kind,
            path: path.into(),
            step: step.map(str::to_string),
        });
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.records.lock().clone()
    }
}

/// Everything a handler may look at while executing one step.
pub struct StepContext<'a> {
    pub step_id: &'a str,
    /// 0-based position in the script.
    pub step_index: usize,
    pub variables: &'a VariableStore,
    pub supervisor: &'a mut InstanceSupervisor,
    pub settings: &'a Settings,
    pub artifacts: &'a ArtifactSink,
    /// Outcomes of earlier steps, in script order.
    pub history: &'a [StepOutcome],
}

impl StepContext<'_> {
    pub fn instance(&self) -> Option<&Instance> {
        self.supervisor.instance()
    }

    /// The current instance, which must be running.
    pub fn require_instance(&self) -> Result<&Instance> {
        match self.supervisor.instance() {
            Some(i) if i.status == InstanceStatus::Running => Ok(i),
            Some(i) => Err(Error::InstanceUnavailable(format!(
                "instance '{}' is {}",
                i.id, i.status
            ))),
            None => Err(Error::InstanceUnavailable(
                "this run has no instance".to_string(),
            )),
        }
    }

    pub fn record_artifact(&self, kind: ArtifactKind, path: impl Into<PathBuf>) {
        self.artifacts.record(kind, path, Some(self.step_id));
    }
}
