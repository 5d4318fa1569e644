//! Script document types.
//!
//! A script is a JSON document with a name, a settings record and an ordered
//! list of steps. These types are read once at load time and never mutated
//! while a run executes.

use super::parse_duration_string;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default URL used when `use_existing_instance` names neither a URL nor an id.
pub const DEFAULT_EXISTING_INSTANCE_URL: &str = "http://localhost:6701";

/// Top-level script document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub script_name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Script {
    /// Script name reduced to `[a-z0-9_]`, used for session and instance ids.
    pub fn sanitized_name(&self) -> String {
        sanitize_name(&self.script_name)
    }
}

/// Lowercases and replaces anything outside `[a-z0-9_]` so the result is
/// safe as a directory name component.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if cleaned.is_empty() {
        "script".to_string()
    } else {
        cleaned
    }
}

/// Run-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(default)]
    pub use_temp_instance: bool,

    #[serde(default)]
    pub use_existing_instance: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_instance_url: Option<String>,

    /// Id of an instance left running by an earlier `auto_cleanup: false` run.
    /// Takes precedence over `existing_instance_url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_instance_id: Option<String>,

    #[serde(default)]
    pub video_recording: bool,

    #[serde(default = "default_true")]
    pub take_screenshots: bool,

    #[serde(default = "default_true")]
    pub auto_cleanup: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_config: Option<Value>,

    #[serde(default)]
    pub instance: InstanceSettings,

    /// Keys this runner does not recognize; reported as validation warnings.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            headless: true,
            use_temp_instance: false,
            use_existing_instance: false,
            existing_instance_url: None,
            existing_instance_id: None,
            video_recording: false,
            take_screenshots: true,
            auto_cleanup: true,
            database_config: None,
            instance: InstanceSettings::default(),
            extra: Map::new(),
        }
    }
}

/// Which kind of instance a run operates against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceMode {
    None,
    Temp,
    Existing(ExistingTarget),
}

/// How an existing instance is located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistingTarget {
    Url(String),
    Id(String),
}

impl Settings {
    /// Resolve the instance mode. Callers must have validated that the two
    /// instance flags are not both set.
    pub fn instance_mode(&self) -> InstanceMode {
        if self.use_existing_instance {
            let target = match (&self.existing_instance_id, &self.existing_instance_url) {
                (Some(id), _) => ExistingTarget::Id(id.clone()),
                (None, Some(url)) => ExistingTarget::Url(url.clone()),
                (None, None) => ExistingTarget::Url(DEFAULT_EXISTING_INSTANCE_URL.to_string()),
            };
            InstanceMode::Existing(target)
        } else if self.use_temp_instance {
            InstanceMode::Temp
        } else {
            InstanceMode::None
        }
    }
}

/// How a temporary instance is materialized, started and probed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSettings {
    /// Application sources copied into the working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<PathBuf>,

    /// Back-end server command (run with `bash -c`). Port placeholders are
    /// substituted before spawning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_command: Option<String>,

    /// Front-end server command. Optional: without it only the back-end is
    /// supervised and probed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_timeout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_interval: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_timeout: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<[u16; 2]>,
}

impl InstanceSettings {
    pub const DEFAULT_BACKEND_COMMAND: &'static str =
        "python3 -m http.server {{back_port}} --bind 127.0.0.1";
    pub const DEFAULT_HEALTH_PATH: &'static str = "/health";
    pub const DEFAULT_INSTALL_COMMAND: &'static str = "fiber install app . --verbose";
    pub const DEFAULT_PORT_RANGE: (u16, u16) = (6000, 7000);

    pub fn backend_command(&self) -> &str {
        self.backend_command
            .as_deref()
            .unwrap_or(Self::DEFAULT_BACKEND_COMMAND)
    }

    pub fn health_path(&self) -> &str {
        self.health_path
            .as_deref()
            .unwrap_or(Self::DEFAULT_HEALTH_PATH)
    }

    pub fn frontend_path(&self) -> &str {
        self.frontend_path.as_deref().unwrap_or("/")
    }

    pub fn readiness_timeout(&self) -> Duration {
        duration_or(&self.readiness_timeout, Duration::from_secs(30))
    }

    pub fn probe_interval(&self) -> Duration {
        duration_or(&self.probe_interval, Duration::from_millis(500))
    }

    pub fn grace_period(&self) -> Duration {
        duration_or(&self.grace_period, Duration::from_secs(3))
    }

    pub fn install_command(&self) -> &str {
        self.install_command
            .as_deref()
            .unwrap_or(Self::DEFAULT_INSTALL_COMMAND)
    }

    pub fn install_timeout(&self) -> Duration {
        duration_or(&self.install_timeout, Duration::from_secs(120))
    }

    pub fn port_range(&self) -> (u16, u16) {
        self.port_range
            .map(|[lo, hi]| (lo, hi))
            .unwrap_or(Self::DEFAULT_PORT_RANGE)
    }

    /// Every duration field paired with its raw value, for validation.
    pub(crate) fn duration_fields(&self) -> [(&'static str, Option<&str>); 4] {
        [
            ("readiness_timeout", self.readiness_timeout.as_deref()),
            ("probe_interval", self.probe_interval.as_deref()),
            ("grace_period", self.grace_period.as_deref()),
            ("install_timeout", self.install_timeout.as_deref()),
        ]
    }
}

fn duration_or(raw: &Option<String>, default: Duration) -> Duration {
    raw.as_deref()
        .and_then(parse_duration_string)
        .unwrap_or(default)
}

fn default_true() -> bool {
    true
}

/// One declared unit of work, routed by `(type, action)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type", default)]
    pub step_type: String,

    #[serde(default)]
    pub action: Option<String>,

    #[serde(default)]
    pub description: String,

    #[serde(default = "empty_object")]
    pub config: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
}

impl Step {
    pub fn action(&self) -> &str {
        self.action.as_deref().unwrap_or_default()
    }

    pub fn continues_on_error(&self) -> bool {
        self.continue_on_error.unwrap_or(false)
    }

    pub fn is_instance_step(&self) -> bool {
        self.step_type == "instance"
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}
