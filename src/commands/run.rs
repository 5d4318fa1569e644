use crate::output::UserOutput;
use script_runner::runner::{RunOutcome, RunStatus, RunnerOptions, ScriptRunner};
use script_runner::variables::StepStatus;
use std::path::Path;

/// Execute a script file. Returns whether the run completed.
pub async fn run_script(
    script: &Path,
    options: RunnerOptions,
    out: &dyn UserOutput,
) -> anyhow::Result<bool> {
    let runner = ScriptRunner::new(options)?;
    out.status(&format!("Running {}", script.display()));

    let outcome = runner.run_file(script).await?;
    report(&outcome, out);
    Ok(outcome.is_completed())
}

fn report(outcome: &RunOutcome, out: &dyn UserOutput) {
    out.blank();
    for step in &outcome.steps {
        let icon = match step.status {
            StepStatus::Succeeded => "+",
            StepStatus::Failed => "x",
            StepStatus::Skipped => "-",
        };
        let mut line = format!(
            "  {} {:<30} {:<10} {:>6}ms",
            icon,
            step.id,
            step.status.to_string(),
            step.duration_ms
        );
        if let Some(error) = &step.error {
            line.push_str(&format!("  [{}] {}", error.handler, error.message));
        }
        out.status(&line);
    }
    if !outcome.steps.is_empty() {
        out.blank();
    }

    out.status(&format!("Session: {}", outcome.session_dir.display()));
    out.status(&format!("Manifest: {}", outcome.manifest_path.display()));
    let summary = format!("Run {}: {}", outcome.state, outcome.status);
    match outcome.status {
        RunStatus::Success => out.success(&summary),
        RunStatus::Partial => out.warning(&summary),
        RunStatus::Failed => out.error(&summary),
    }
    if let Some(error) = &outcome.first_error {
        out.error(&format!("First error: {}", error));
    }
}
