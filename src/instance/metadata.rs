//! Persisted per-instance metadata (`instance.json`).
//!
//! Written when a temporary instance is provisioned and refreshed once its
//! servers are spawned. A later run reconnects through it with
//! `use_existing_instance` + `existing_instance_id`, and `srun instances`
//! uses it to find leftovers.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "instance.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedProcess {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub instance_id: String,
    pub script_name: String,
    pub base_url: String,
    pub api_url: String,
    pub front_port: u16,
    pub back_port: u16,
    pub working_directory: PathBuf,
    /// Spawned servers keyed by role (`backend`, `frontend`).
    #[serde(default)]
    pub processes: BTreeMap<String, RecordedProcess>,
    /// Log files keyed by file name.
    #[serde(default)]
    pub logs: BTreeMap<String, PathBuf>,
    pub created_at: DateTime<Utc>,
    /// False once a run ended with `auto_cleanup: false` and left it running.
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,
}

fn default_true() -> bool {
    true
}

impl InstanceMetadata {
    pub fn save(&self) -> Result<()> {
        let path = self.working_directory.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(self)?;
        // Write-then-rename so a reader never sees a half-written file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::InstanceUnavailable(format!(
                "cannot read instance metadata {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::InstanceUnavailable(format!(
                "invalid instance metadata {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Load the metadata of instance `id` under `instances_root`.
    pub fn load_by_id(instances_root: &Path, id: &str) -> Result<Self> {
        if id.is_empty() || id.contains('/') || id.contains("..") {
            return Err(Error::InstanceUnavailable(format!(
                "invalid instance id '{}'",
                id
            )));
        }
        Self::load(&instances_root.join(id).join(METADATA_FILE))
    }

    /// Every readable metadata file directly under `instances_root`, oldest
    /// first. Unreadable entries are skipped with a warning.
    pub fn list(instances_root: &Path) -> Result<Vec<Self>> {
        let entries = match fs::read_dir(instances_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let path = entry?.path().join(METADATA_FILE);
            if !path.is_file() {
                continue;
            }
            match Self::load(&path) {
                Ok(meta) => found.push(meta),
                Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
            }
        }
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    /// PIDs of recorded processes that are still alive, or whose process
    /// group still has members after the leader exited.
    pub fn live_pids(&self) -> Vec<u32> {
        self.processes
            .values()
            .filter(|p| {
                crate::error::is_pid_alive(p.pid) || super::process::recorded_group_alive(p.pid)
            })
            .map(|p| p.pid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dir: &Path, id: &str) -> InstanceMetadata {
        InstanceMetadata {
            instance_id: id.to_string(),
            script_name: "demo".to_string(),
            base_url: "http://localhost:6101".to_string(),
            api_url: "http://localhost:6102".to_string(),
            front_port: 6101,
            back_port: 6102,
            working_directory: dir.join(id),
            processes: BTreeMap::from([(
                "backend".to_string(),
                RecordedProcess {
                    pid: std::process::id(),
                    started_at: Utc::now(),
                    command: "sleep 30".to_string(),
                },
            )]),
            logs: BTreeMap::new(),
            created_at: Utc::now(),
            auto_cleanup: false,
        }
    }

    #[test]
    fn test_save_and_load_by_id() {
        let root = tempfile::tempdir().unwrap();
        let meta = sample(root.path(), "demo_1");
        fs::create_dir_all(&meta.working_directory).unwrap();
        meta.save().unwrap();

        let loaded = InstanceMetadata::load_by_id(root.path(), "demo_1").unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(loaded.live_pids(), vec![std::process::id()]);
    }

    #[test]
    fn test_load_by_id_rejects_traversal() {
        let root = tempfile::tempdir().unwrap();
        assert!(InstanceMetadata::load_by_id(root.path(), "../etc").is_err());
        assert!(matches!(
            InstanceMetadata::load_by_id(root.path(), "missing"),
            Err(Error::InstanceUnavailable(_))
        ));
    }

    #[test]
    fn test_list_skips_garbage() {
        let root = tempfile::tempdir().unwrap();
        for id in ["a_1", "b_2"] {
            let meta = sample(root.path(), id);
            fs::create_dir_all(&meta.working_directory).unwrap();
            meta.save().unwrap();
        }
        fs::create_dir_all(root.path().join("junk")).unwrap();
        fs::write(root.path().join("junk").join(METADATA_FILE), "{").unwrap();

        let listed = InstanceMetadata::list(root.path()).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(InstanceMetadata::list(&root.path().join("nope"))
            .unwrap()
            .is_empty());
    }
}
