//! Working-directory layout and materialization for temporary instances.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory and file names skipped when copying application sources.
const IGNORED_NAMES: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    "__pycache__",
    ".DS_Store",
];
const IGNORED_EXTENSIONS: &[&str] = &["pyc"];

const STORAGE_DIRS: &[&str] = &["uploads", "app_bundles", "entity_bundles"];

/// Paths inside one instance working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    root: PathBuf,
}

impl InstanceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn runtime_config(&self) -> PathBuf {
        self.config_dir().join("runtime.json")
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(".env.instance")
    }

    pub fn local_data(&self) -> PathBuf {
        self.root.join("local_data")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.root.join("instance.json")
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:///{}", self.local_data().join("app.db").display())
    }
}

/// Contents of `config/runtime.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub instance_id: String,
    pub front_port: u16,
    pub back_port: u16,
    pub base_url: String,
    pub api_url: String,
    pub database_url: String,
    pub storage: BTreeMap<String, PathBuf>,
}

/// Create the working directory, copy sources and write config files.
pub fn materialize(
    layout: &InstanceLayout,
    source: Option<&Path>,
    runtime: &RuntimeConfig,
    environment: &BTreeMap<String, String>,
) -> Result<()> {
    let provisioning = |what: &str, e: &dyn std::fmt::Display| {
        Error::Provisioning(format!("{} in {}: {}", what, layout.root().display(), e))
    };

    fs::create_dir_all(layout.root())
        .map_err(|e| provisioning("cannot create working directory", &e))?;

    if let Some(source) = source {
        if !source.is_dir() {
            return Err(Error::Provisioning(format!(
                "source directory {} does not exist",
                source.display()
            )));
        }
        copy_sources(source, layout.root())?;
    }

    for dir in [layout.config_dir(), layout.logs_dir()] {
        fs::create_dir_all(&dir).map_err(|e| provisioning("cannot create directory", &e))?;
    }
    for name in STORAGE_DIRS {
        fs::create_dir_all(layout.local_data().join(name))
            .map_err(|e| provisioning("cannot create storage directory", &e))?;
    }

    let json = serde_json::to_string_pretty(runtime)?;
    fs::write(layout.runtime_config(), json)
        .map_err(|e| provisioning("cannot write runtime config", &e))?;

    let env_text: String = environment
        .iter()
        .map(|(k, v)| format!("{}={}\n", k, v))
        .collect();
    fs::write(layout.env_file(), env_text)
        .map_err(|e| provisioning("cannot write environment file", &e))?;

    Ok(())
}

/// Storage directory map recorded in the runtime config.
pub fn storage_paths(layout: &InstanceLayout) -> BTreeMap<String, PathBuf> {
    STORAGE_DIRS
        .iter()
        .map(|name| (name.to_string(), layout.local_data().join(name)))
        .collect()
}

fn is_ignored(name: &str) -> bool {
    IGNORED_NAMES.contains(&name)
        || Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| IGNORED_EXTENSIONS.contains(&ext))
}

/// Recursively copy `src` into `dst`, skipping ignored names at any depth.
/// When `dst` lies inside `src`, the branch leading to it is not copied.
pub fn copy_sources(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)
        .map_err(|e| Error::Provisioning(format!("cannot create {}: {}", dst.display(), e)))?;

    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        if e.depth() == 0 {
            return true;
        }
        if e.path().starts_with(dst) || dst.starts_with(e.path()) {
            return false;
        }
        !is_ignored(&e.file_name().to_string_lossy())
    });

    let mut copied = 0usize;
    for entry in walker {
        let entry = entry.map_err(|e| Error::Provisioning(format!("cannot read sources: {}", e)))?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        let result = if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::Provisioning(format!("cannot copy sources: {}", e)))?;
            }
            copied += 1;
            fs::copy(entry.path(), &target).map(|_| ())
        };
        result.map_err(|e| {
            Error::Provisioning(format!(
                "cannot copy {} to {}: {}",
                entry.path().display(),
                target.display(),
                e
            ))
        })?;
    }

    tracing::debug!(files = copied, from = %src.display(), to = %dst.display(), "Copied application sources");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(layout: &InstanceLayout) -> RuntimeConfig {
        RuntimeConfig {
            instance_id: "demo_1".to_string(),
            front_port: 6101,
            back_port: 6102,
            base_url: "http://localhost:6101".to_string(),
            api_url: "http://localhost:6102".to_string(),
            database_url: layout.database_url(),
            storage: storage_paths(layout),
        }
    }

    #[test]
    fn test_copy_skips_ignored_entries() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("app/node_modules/pkg")).unwrap();
        fs::create_dir_all(src.path().join(".git")).unwrap();
        fs::create_dir_all(src.path().join("app/__pycache__")).unwrap();
        fs::write(src.path().join("app/main.py"), "print(1)").unwrap();
        fs::write(src.path().join("app/main.pyc"), "x").unwrap();
        fs::write(src.path().join("app/node_modules/pkg/index.js"), "x").unwrap();
        fs::write(src.path().join(".DS_Store"), "x").unwrap();

        copy_sources(src.path(), dst.path()).unwrap();

        assert!(dst.path().join("app/main.py").exists());
        assert!(!dst.path().join("app/main.pyc").exists());
        assert!(!dst.path().join("app/node_modules").exists());
        assert!(!dst.path().join("app/__pycache__").exists());
        assert!(!dst.path().join(".git").exists());
        assert!(!dst.path().join(".DS_Store").exists());
    }

    #[test]
    fn test_copy_does_not_recurse_into_destination() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), "a").unwrap();
        let dst = src.path().join("instances/one");
        copy_sources(src.path(), &dst).unwrap();
        assert!(dst.join("a.txt").exists());
        assert!(!dst.join("instances").exists());
    }

    #[test]
    fn test_materialize_layout() {
        let root = tempfile::tempdir().unwrap();
        let layout = InstanceLayout::new(root.path().join("demo_1"));
        let env = BTreeMap::from([("PORT".to_string(), "6102".to_string())]);
        materialize(&layout, None, &runtime(&layout), &env).unwrap();

        assert!(layout.logs_dir().is_dir());
        assert!(layout.local_data().join("uploads").is_dir());
        assert!(layout.local_data().join("entity_bundles").is_dir());
        let written: RuntimeConfig =
            serde_json::from_str(&fs::read_to_string(layout.runtime_config()).unwrap()).unwrap();
        assert_eq!(written.back_port, 6102);
        assert!(written.database_url.starts_with("sqlite:///"));
        assert_eq!(
            fs::read_to_string(layout.env_file()).unwrap(),
            "PORT=6102\n"
        );
    }

    #[test]
    fn test_materialize_missing_source_fails() {
        let root = tempfile::tempdir().unwrap();
        let layout = InstanceLayout::new(root.path().join("x"));
        let err = materialize(
            &layout,
            Some(Path::new("/no/such/source")),
            &runtime(&layout),
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Provisioning(_)));
    }
}
