//! Built-in step handlers.
//!
//! Browser, user and api_key actions are driven by external tools and are
//! not registered here; steps using them fail with `HandlerNotFound`.

mod command;
mod instance;
mod report;
mod variables;

pub use command::{AnalyzeServerLogs, ApiTest, RunCommand};
pub use instance::{CleanupInstance, CreateTempInstance, InstallApp, StartExistingInstance};
pub use report::GenerateHtmlReport;
pub use variables::{SetSessionVariables, VerifySessionVariable};

use crate::config::duration_from_value;
use crate::dispatch::HandlerRegistry;
use crate::error::{Error, Result};
use serde_json::Value;
use std::time::Duration;

/// Register every built-in handler.
pub fn register_builtin(registry: &mut HandlerRegistry) -> Result<()> {
    registry.register("instance", "create_temp_instance", CreateTempInstance)?;
    registry.register("instance", "start_existing_instance", StartExistingInstance)?;
    registry.register("instance", "cleanup_instance", CleanupInstance)?;
    registry.register("instance", "install_app", InstallApp)?;
    registry.register("command", "run_command", RunCommand)?;
    registry.register("command", "api_test", ApiTest)?;
    registry.register("command", "analyze_server_logs", AnalyzeServerLogs)?;
    registry.register("command", "generate_html_report", GenerateHtmlReport)?;
    registry.register("test", "set_session_variables", SetSessionVariables)?;
    registry.register("test", "verify_session_variable", VerifySessionVariable)?;
    Ok(())
}

/// A registry holding all built-in handlers.
pub fn builtin_registry() -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    register_builtin(&mut registry)?;
    Ok(registry)
}

fn opt_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn require_str<'a>(config: &'a Value, key: &str) -> Result<&'a str> {
    opt_str(config, key)
        .ok_or_else(|| Error::HandlerExecution(format!("missing required config '{}'", key)))
}

/// Booleans may arrive as JSON booleans or as resolved template strings.
fn opt_bool(config: &Value, key: &str) -> Option<bool> {
    match config.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn opt_duration(config: &Value, key: &str, default: Duration) -> Duration {
    duration_from_value(config.get(key), default)
}
