use crate::output::UserOutput;
use script_runner::config::{InstanceMode, Parser};
use script_runner::handlers::builtin_registry;
use std::path::Path;

/// Load and statically validate a script. Returns whether it is valid.
pub fn run_validate(script_path: &Path, out: &dyn UserOutput) -> anyhow::Result<bool> {
    out.status(&format!("Validating {}...", script_path.display()));

    let script = match Parser::new().load_script(script_path) {
        Ok(script) => script,
        Err(e) => {
            out.error("Script failed to load");
            out.error(&e.with_suggestion());
            return Ok(false);
        }
    };

    let registry = builtin_registry()?;
    let warnings = match script.validate(&registry) {
        Ok(warnings) => warnings,
        Err(e) => {
            out.error(&e.to_string());
            return Ok(false);
        }
    };
    for warning in &warnings {
        out.warning(&format!("warning: {}", warning));
    }

    out.success("Script is valid");
    out.blank();
    out.status(&format!("Script: {}", script.script_name));
    let mode = match script.settings.instance_mode() {
        InstanceMode::None => "none".to_string(),
        InstanceMode::Temp => "temporary".to_string(),
        InstanceMode::Existing(target) => format!("existing ({:?})", target),
    };
    out.status(&format!("Instance: {}", mode));
    out.status(&format!("Steps: {}", script.steps.len()));
    for step in &script.steps {
        let mut line = format!("  - {} ({}/{})", step.id, step.step_type, step.action());
        if step.continues_on_error() {
            line.push_str(" [continue_on_error]");
        }
        if let Some(condition) = &step.condition {
            line.push_str(&format!(" if {}", condition));
        }
        out.status(&line);
    }
    Ok(true)
}
