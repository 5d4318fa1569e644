//! Script execution.
//!
//! [`ScriptRunner`] drives one run through
//! `loading -> provisioning -> executing -> finalizing -> {completed, aborted}`.
//! Steps run strictly in declared order on a single task. Finalization
//! (log capture, instance teardown, manifest) runs exactly once per run,
//! whether the step sequence completed or was aborted.

mod session;

pub use crate::dispatch::StepOutcome;
pub use session::{Manifest, RunSession, RunState, RunStatus, MANIFEST_FILE};

use crate::config::{InstanceMode, Parser, Script, Step};
use crate::dispatch::{ActionDispatcher, DispatchTarget, HandlerRegistry, StepError, StepResult};
use crate::error::Result;
use crate::handlers::builtin_registry;
use crate::instance::{InstanceSupervisor, ProvisionMode};
use crate::variables::{Condition, ConditionContext, StepStatus, VariableStore};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const DEFAULT_RUNS_DIR: &str = "runs";
pub const DEFAULT_INSTANCES_DIR: &str = "temp-instances";

/// Where a runner puts run sessions and temporary instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    pub runs_root: PathBuf,
    pub instances_root: PathBuf,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            runs_root: PathBuf::from(DEFAULT_RUNS_DIR),
            instances_root: PathBuf::from(DEFAULT_INSTANCES_DIR),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub session_id: String,
    pub session_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub state: RunState,
    pub status: RunStatus,
    pub first_error: Option<String>,
    pub steps: Vec<StepOutcome>,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }
}

pub struct ScriptRunner {
    options: RunnerOptions,
    dispatcher: ActionDispatcher,
}

/// Mutable state of one run, threaded through the phases.
struct RunContext {
    state: RunState,
    session: RunSession,
    variables: VariableStore,
    supervisor: InstanceSupervisor,
    statuses: HashMap<String, StepStatus>,
    first_error: Option<String>,
}

impl RunContext {
    fn transition(&mut self, to: RunState) {
        tracing::debug!(session = %self.session.id(), from = %self.state, to = %to, "Run state change");
        self.state = to;
    }

    fn note_error(&mut self, message: String) {
        if self.first_error.is_none() {
            self.first_error = Some(message);
        }
    }
}

/// Make the instance's URLs, ports and id available to templates.
fn seed_instance_variables(run: &mut RunContext) {
    let Some(instance) = run.supervisor.instance() else {
        return;
    };
    for (key, value) in instance.variables() {
        run.variables.set(key, value, "Instance information");
    }
}

impl ScriptRunner {
    /// A runner with every built-in handler registered.
    pub fn new(options: RunnerOptions) -> Result<Self> {
        Ok(Self::with_registry(options, builtin_registry()?))
    }

    pub fn with_registry(options: RunnerOptions, registry: HandlerRegistry) -> Self {
        Self {
            options,
            dispatcher: ActionDispatcher::new(registry),
        }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn registry(&self) -> &HandlerRegistry {
        self.dispatcher.registry()
    }

    /// Load a script file and run it. Fails only when the file cannot be
    /// loaded or the session directory cannot be written.
    pub async fn run_file(&self, path: impl AsRef<Path>) -> Result<RunOutcome> {
        let script = Parser::new().load_script(path)?;
        self.run(&script).await
    }

    #[tracing::instrument(skip(self, script), fields(script = %script.script_name))]
    pub async fn run(&self, script: &Script) -> Result<RunOutcome> {
        let session = RunSession::create(
            &self.options.runs_root,
            &script.sanitized_name(),
            script.settings.video_recording,
        )?;
        let mut run = RunContext {
            state: RunState::Loading,
            session,
            variables: VariableStore::new(),
            supervisor: InstanceSupervisor::new(
                &self.options.instances_root,
                script.script_name.clone(),
                script.settings.instance.clone(),
            ),
            statuses: HashMap::new(),
            first_error: None,
        };
        tracing::info!(session = %run.session.id(), steps = script.steps.len(), "Starting run");

        let aborted = match script.validate(self.registry()) {
            Ok(warnings) => {
                for warning in &warnings {
                    tracing::warn!("{}", warning);
                }
                !self.provision(script, &mut run).await || !self.execute(script, &mut run).await
            }
            Err(e) => {
                tracing::error!("{}", e);
                run.note_error(e.to_string());
                true
            }
        };

        self.finalize(script, run, aborted).await
    }

    /// Existing-mode instances are attached up front. Temporary instances
    /// come up lazily before the first step that is not an instance step.
    async fn provision(&self, script: &Script, run: &mut RunContext) -> bool {
        run.transition(RunState::Provisioning);
        if let InstanceMode::Existing(target) = script.settings.instance_mode() {
            if let Err(e) = run.supervisor.provision(ProvisionMode::Existing(target)).await {
                tracing::error!("Could not attach to existing instance: {}", e);
                run.note_error(e.to_string());
                return false;
            }
            seed_instance_variables(run);
        }
        true
    }

    /// Returns false when the run was aborted.
    async fn execute(&self, script: &Script, run: &mut RunContext) -> bool {
        run.transition(RunState::Executing);
        let lazy_temp = script.settings.instance_mode() == InstanceMode::Temp;

        for (index, step) in script.steps.iter().enumerate() {
            let started = Instant::now();

            if let Some(expression) = &step.condition {
                match Condition::parse(expression) {
                    Ok(condition) => {
                        let ctx = ConditionContext {
                            variables: &run.variables,
                            statuses: &run.statuses,
                        };
                        if !condition.evaluate(&ctx) {
                            tracing::info!(step = %step.id, condition = %expression, "Step skipped");
                            self.record(run, index, step, StepStatus::Skipped, StepResult::ok(), started);
                            continue;
                        }
                    }
                    Err(e) => {
                        let result = StepResult::from_error(&e, "");
                        if !self.record_failure(run, index, step, result, started) {
                            return false;
                        }
                        continue;
                    }
                }
            }

            if lazy_temp && !step.is_instance_step() && run.supervisor.instance().is_none() {
                if let Err(e) = self.bring_up_temp(run).await {
                    // The step never ran, but it is the one that needed the instance.
                    let result = StepResult::from_error(&e, "instance/create_temp_instance");
                    self.record_failure(run, index, step, result, started);
                    return false;
                }
            }

            let result = self
                .dispatcher
                .dispatch(DispatchTarget {
                    step,
                    index,
                    variables: &mut run.variables,
                    supervisor: &mut run.supervisor,
                    settings: &script.settings,
                    artifacts: run.session.artifacts(),
                    history: run.session.outcomes(),
                })
                .await;

            if result.success {
                tracing::info!(
                    step = %step.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Step succeeded"
                );
                self.record(run, index, step, StepStatus::Succeeded, result, started);
            } else if !self.record_failure(run, index, step, result, started) {
                return false;
            }
        }
        true
    }

    async fn bring_up_temp(&self, run: &mut RunContext) -> Result<()> {
        run.supervisor.provision(ProvisionMode::Temp).await?;
        run.supervisor.start().await?;
        seed_instance_variables(run);
        Ok(())
    }

    /// Record a failed step. Returns whether the run may continue.
    fn record_failure(
        &self,
        run: &mut RunContext,
        index: usize,
        step: &Step,
        result: StepResult,
        started: Instant,
    ) -> bool {
        let message = result
            .error_message()
            .unwrap_or("step failed")
            .to_string();
        let continues = step.continues_on_error();
        tracing::warn!(step = %step.id, continue_on_error = continues, "Step failed: {}", message);
        run.note_error(format!("step '{}' failed: {}", step.id, message));
        self.record(run, index, step, StepStatus::Failed, result, started);
        if !continues {
            tracing::error!(step = %step.id, "Aborting run");
        }
        continues
    }

    fn record(
        &self,
        run: &mut RunContext,
        index: usize,
        step: &Step,
        status: StepStatus,
        result: StepResult,
        started: Instant,
    ) {
        let error = result.error.map(|mut e: StepError| {
            if e.handler.is_empty() {
                e.handler = format!("{}/{}", step.step_type, step.action());
            }
            e
        });
        run.statuses.insert(step.id.clone(), status);
        run.session.record(StepOutcome {
            index,
            id: step.id.clone(),
            step_type: step.step_type.clone(),
            action: step.action().to_string(),
            description: (!step.description.is_empty()).then(|| step.description.clone()),
            status,
            success: status != StepStatus::Failed,
            duration_ms: started.elapsed().as_millis() as u64,
            data: result.data,
            error,
        });
    }

    async fn finalize(&self, script: &Script, mut run: RunContext, aborted: bool) -> Result<RunOutcome> {
        run.transition(RunState::Finalizing);

        // Logs first: stopping with auto_cleanup removes the working directory.
        run.session.copy_logs(&run.supervisor.log_files());
        let log_tails = run.supervisor.failure_tails().clone();

        if let Err(e) = run.supervisor.stop(script.settings.auto_cleanup).await {
            tracing::warn!("Instance teardown failed: {}", e);
        }

        let instance = match (run.supervisor.metadata(), run.supervisor.instance()) {
            (Some(metadata), _) => serde_json::to_value(metadata).ok(),
            (None, Some(instance)) => serde_json::to_value(instance).ok(),
            (None, None) => None,
        };

        let state = if aborted {
            RunState::Aborted
        } else {
            RunState::Completed
        };
        let status = match state {
            RunState::Aborted => RunStatus::Failed,
            _ if run.session.has_failures() => RunStatus::Partial,
            _ => RunStatus::Success,
        };
        run.transition(state);

        let manifest = Manifest {
            script_name: script.script_name.clone(),
            session_id: run.session.id().to_string(),
            state,
            status,
            started_at: run.session.started_at(),
            finished_at: chrono::Utc::now(),
            first_error: run.first_error.clone(),
            steps: run.session.outcomes().to_vec(),
            artifacts: run.session.artifacts().artifacts(),
            session_variables: run.variables.snapshot(),
            instance,
            log_tails,
            script: serde_json::to_value(script).unwrap_or(Value::Null),
        };
        let manifest_path = run.session.write_manifest(&manifest)?;

        tracing::info!(
            session = %run.session.id(),
            %state,
            %status,
            steps = manifest.steps.len(),
            "Run finished"
        );

        Ok(RunOutcome {
            session_id: manifest.session_id,
            session_dir: run.session.dir().to_path_buf(),
            manifest_path,
            state,
            status,
            first_error: manifest.first_error,
            steps: manifest.steps,
        })
    }
}
