use super::{opt_bool, opt_duration, opt_str, require_str};
use crate::config::{ExistingTarget, InstanceMode};
use crate::dispatch::{Handler, StepContext, StepResult};
use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceKind, InstanceStatus, ProvisionMode};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

fn instance_result(instance: &Instance) -> StepResult {
    let mut result = StepResult::ok()
        .with_data("instance_id", instance.id.as_str())
        .with_data("kind", instance.kind.to_string())
        .with_data("status", instance.status.to_string());
    for (key, value) in instance.variables() {
        result = result
            .with_data(key, value.as_str())
            .with_variable(key, value, "Instance information");
    }
    result
}

/// Bring up the run's instance, or report the one already up.
pub struct CreateTempInstance;

#[async_trait]
impl Handler for CreateTempInstance {
    async fn execute(&self, _config: &Value, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        match ctx.settings.instance_mode() {
            InstanceMode::Temp => {
                let state = ctx.supervisor.instance().map(|i| (i.kind, i.status));
                match state {
                    None => {
                        ctx.supervisor.provision(ProvisionMode::Temp).await?;
                        ctx.supervisor.start().await?;
                    }
                    Some((InstanceKind::Temp, InstanceStatus::Ready)) => {
                        ctx.supervisor.start().await?;
                    }
                    Some((_, InstanceStatus::Running)) => {
                        tracing::debug!(step = ctx.step_id, "Instance already running");
                    }
                    Some((_, status)) => {
                        return Err(Error::InvalidInstanceState {
                            operation: "create".to_string(),
                            state: status.to_string(),
                        })
                    }
                }
            }
            InstanceMode::Existing(target) => {
                if ctx.supervisor.instance().is_none() {
                    ctx.supervisor
                        .provision(ProvisionMode::Existing(target))
                        .await?;
                }
            }
            InstanceMode::None => {
                return Err(Error::InstanceUnavailable(
                    "instance mode is not enabled".to_string(),
                ))
            }
        }

        let instance = ctx.require_instance()?;
        tracing::info!(instance = %instance.id, url = %instance.base_url, "Instance available");
        Ok(instance_result(instance))
    }
}

/// Attach to an instance left running by an earlier run.
pub struct StartExistingInstance;

#[async_trait]
impl Handler for StartExistingInstance {
    async fn execute(&self, config: &Value, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let target = match (opt_str(config, "instance_id"), opt_str(config, "url")) {
            (Some(id), _) => ExistingTarget::Id(id.to_string()),
            (None, Some(url)) => ExistingTarget::Url(url.to_string()),
            (None, None) => match ctx.settings.instance_mode() {
                InstanceMode::Existing(target) => target,
                _ => {
                    return Err(Error::HandlerExecution(
                        "start_existing_instance needs 'instance_id' or 'url'".to_string(),
                    ))
                }
            },
        };

        ctx.supervisor.attach(target)?;
        let instance = ctx.require_instance()?;
        Ok(instance_result(instance)
            .with_variable(
                "existing_instance_url",
                instance.base_url.as_str(),
                "Existing instance URL",
            )
            .with_data("existing_instance_url", instance.base_url.as_str()))
    }
}

/// Stop the instance before the run ends.
pub struct CleanupInstance;

#[async_trait]
impl Handler for CleanupInstance {
    async fn execute(&self, config: &Value, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let auto_cleanup = opt_bool(config, "auto_cleanup").unwrap_or(ctx.settings.auto_cleanup);
        let Some(instance) = ctx.instance() else {
            return Ok(StepResult::ok().with_data("stopped", false));
        };
        let id = instance.id.clone();
        let dir = instance.working_directory.clone();

        ctx.supervisor.stop(auto_cleanup).await?;

        let status = ctx
            .instance()
            .map(|i| i.status.to_string())
            .unwrap_or_default();
        let removed = dir.as_deref().is_some_and(|d| !d.exists());
        Ok(StepResult::ok()
            .with_data("stopped", true)
            .with_data("instance_id", id)
            .with_data("status", status)
            .with_data("auto_cleanup", auto_cleanup)
            .with_data("removed_directory", removed))
    }
}

/// Install an application into the running instance.
pub struct InstallApp;

#[async_trait]
impl Handler for InstallApp {
    async fn execute(&self, config: &Value, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let app_path = Path::new(require_str(config, "app_path")?);
        let command = opt_str(config, "install_command");
        let timeout = opt_duration(config, "timeout", ctx.supervisor.settings().install_timeout());

        let output = ctx
            .supervisor
            .install_app(app_path, command, Some(timeout))
            .await?;

        let result = if output.success() {
            StepResult::ok()
        } else {
            StepResult::failure(format!(
                "install command exited with {}",
                output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "a signal".to_string())
            ))
        };
        Ok(result
            .with_data("app_path", app_path.display().to_string())
            .with_data("exit_code", output.exit_code)
            .with_data("stdout", output.stdout)
            .with_data("stderr", output.stderr))
    }
}
