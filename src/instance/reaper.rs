//! Discovery and cleanup of instances left behind by earlier runs.
//!
//! Runs never call this themselves. It backs `srun instances list|clean` and
//! works purely from the persisted metadata files.

use super::metadata::InstanceMetadata;
use super::process::terminate_recorded_pid;
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct InstanceSummary {
    pub metadata: InstanceMetadata,
    pub live_pids: Vec<u32>,
}

impl InstanceSummary {
    pub fn is_running(&self) -> bool {
        !self.live_pids.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub instance_id: String,
    pub signalled: Vec<u32>,
    pub removed_dir: bool,
    pub errors: Vec<String>,
}

pub struct InstanceReaper {
    instances_root: PathBuf,
    grace: Duration,
}

impl InstanceReaper {
    pub fn new(instances_root: impl AsRef<Path>) -> Self {
        Self {
            instances_root: super::absolute_root(instances_root.as_ref()),
            grace: Duration::from_secs(3),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn list(&self) -> Result<Vec<InstanceSummary>> {
        Ok(InstanceMetadata::list(&self.instances_root)?
            .into_iter()
            .map(|metadata| InstanceSummary {
                live_pids: metadata.live_pids(),
                metadata,
            })
            .collect())
    }

    /// Clean the named instances, or every known instance when `ids` is empty.
    pub async fn clean(&self, ids: &[String]) -> Result<Vec<ReapReport>> {
        let targets: Vec<InstanceMetadata> = if ids.is_empty() {
            InstanceMetadata::list(&self.instances_root)?
        } else {
            let mut targets = Vec::new();
            for id in ids {
                targets.push(InstanceMetadata::load_by_id(&self.instances_root, id)?);
            }
            targets
        };

        let mut reports = Vec::new();
        for metadata in targets {
            reports.push(self.clean_one(&metadata).await);
        }
        Ok(reports)
    }

    async fn clean_one(&self, metadata: &InstanceMetadata) -> ReapReport {
        let mut report = ReapReport {
            instance_id: metadata.instance_id.clone(),
            ..Default::default()
        };

        for (role, process) in &metadata.processes {
            let name = format!("{}/{}", metadata.instance_id, role);
            match terminate_recorded_pid(process.pid, &name, Some(process.started_at), self.grace)
                .await
            {
                Ok(true) => report.signalled.push(process.pid),
                Ok(false) => {}
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        let dir = &metadata.working_directory;
        if !dir.starts_with(&self.instances_root) {
            report.errors.push(format!(
                "refusing to remove {} outside {}",
                dir.display(),
                self.instances_root.display()
            ));
            return report;
        }
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => report.removed_dir = true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => report.errors.push(format!("{}: {}", dir.display(), e)),
        }

        tracing::info!(
            instance = %metadata.instance_id,
            signalled = ?report.signalled,
            removed = report.removed_dir,
            "Reaped instance"
        );
        report
    }
}
