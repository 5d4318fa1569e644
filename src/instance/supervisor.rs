use super::logs::{collect_tails, format_tails, DEFAULT_TAIL_LINES};
use super::metadata::{InstanceMetadata, RecordedProcess};
use super::process::{run_shell_command, CommandOutput, LogPaths, ServerProcess, ServerRole};
use super::readiness::{validate_url, wait_until_ready, HttpProbe, ReadinessCheck, ReadinessOutcome};
use super::workspace::{self, InstanceLayout, RuntimeConfig};
use super::{absolute_root, Instance, InstanceKind, InstanceStatus};
use crate::config::{sanitize_name, ExistingTarget, InstanceSettings};
use crate::error::{Error, Result};
use crate::port::PortAllocator;
use crate::variables::{random_hex, Template};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How an instance comes into existence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionMode {
    Temp,
    Existing(ExistingTarget),
}

/// Owns at most one instance for the duration of a run.
pub struct InstanceSupervisor {
    instances_root: PathBuf,
    script_name: String,
    settings: InstanceSettings,
    instance: Option<Instance>,
    backend: Option<ServerProcess>,
    frontend: Option<ServerProcess>,
    metadata: Option<InstanceMetadata>,
    failure_tails: BTreeMap<String, Vec<String>>,
}

impl InstanceSupervisor {
    pub fn new(
        instances_root: impl AsRef<Path>,
        script_name: impl Into<String>,
        settings: InstanceSettings,
    ) -> Self {
        Self {
            instances_root: absolute_root(instances_root.as_ref()),
            script_name: script_name.into(),
            settings,
            instance: None,
            backend: None,
            frontend: None,
            metadata: None,
            failure_tails: BTreeMap::new(),
        }
    }

    pub fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    pub fn metadata(&self) -> Option<&InstanceMetadata> {
        self.metadata.as_ref()
    }

    pub fn settings(&self) -> &InstanceSettings {
        &self.settings
    }

    pub fn instances_root(&self) -> &Path {
        &self.instances_root
    }

    /// True when an instance is up and can be used by steps.
    pub fn is_running(&self) -> bool {
        matches!(
            self.instance.as_ref().map(|i| i.status),
            Some(InstanceStatus::Running)
        )
    }

    /// Log tails captured when start-up failed.
    pub fn failure_tails(&self) -> &BTreeMap<String, Vec<String>> {
        &self.failure_tails
    }

    fn state_error(&self, operation: &str) -> Error {
        Error::InvalidInstanceState {
            operation: operation.to_string(),
            state: self
                .instance
                .as_ref()
                .map(|i| i.status.to_string())
                .unwrap_or_else(|| "none".to_string()),
        }
    }

    #[tracing::instrument(skip(self), fields(script = %self.script_name))]
    pub async fn provision(&mut self, mode: ProvisionMode) -> Result<()> {
        if self.instance.is_some() {
            return Err(self.state_error("provision"));
        }
        match mode {
            ProvisionMode::Temp => self.provision_temp().await,
            ProvisionMode::Existing(ExistingTarget::Url(url)) => self.attach_url(&url),
            ProvisionMode::Existing(ExistingTarget::Id(id)) => self.attach_id(&id),
        }
    }

    async fn provision_temp(&mut self) -> Result<()> {
        let (low, high) = self.settings.port_range();
        let (front_port, back_port) = PortAllocator::new(low, high).allocate_pair()?;

        let id = format!(
            "{}_{}_{}",
            sanitize_name(&self.script_name),
            chrono::Local::now().format("%Y%m%d_%H%M%S"),
            random_hex(8)
        );
        let layout = InstanceLayout::new(self.instances_root.join(&id));
        let api_url = format!("http://localhost:{}", back_port);
        // Without a front-end the back-end is what a browser step talks to.
        let base_url = if self.settings.frontend_command.is_some() {
            format!("http://localhost:{}", front_port)
        } else {
            api_url.clone()
        };

        self.instance = Some(Instance {
            id: id.clone(),
            kind: InstanceKind::Temp,
            status: InstanceStatus::Provisioning,
            base_url: base_url.clone(),
            api_url: api_url.clone(),
            front_port: Some(front_port),
            back_port: Some(back_port),
            working_directory: Some(layout.root().to_path_buf()),
            created_at: Utc::now(),
        });
        tracing::info!(instance = %id, front_port, back_port, dir = %layout.root().display(), "Provisioning temporary instance");

        let runtime = RuntimeConfig {
            instance_id: id.clone(),
            front_port,
            back_port,
            base_url: base_url.clone(),
            api_url: api_url.clone(),
            database_url: layout.database_url(),
            storage: workspace::storage_paths(&layout),
        };
        let env: BTreeMap<String, String> = self
            .server_environment(ServerRole::Backend)
            .into_iter()
            .collect();

        let source = self.settings.source_dir.clone();
        let materialized = workspace::materialize(&layout, source.as_deref(), &runtime, &env)
            .and_then(|()| {
                let metadata = InstanceMetadata {
                    instance_id: id.clone(),
                    script_name: self.script_name.clone(),
                    base_url,
                    api_url,
                    front_port,
                    back_port,
                    working_directory: layout.root().to_path_buf(),
                    processes: BTreeMap::new(),
                    logs: BTreeMap::new(),
                    created_at: Utc::now(),
                    auto_cleanup: true,
                };
                metadata.save()?;
                Ok(metadata)
            });

        match materialized {
            Ok(metadata) => {
                self.metadata = Some(metadata);
                self.set_status(InstanceStatus::Ready);
                Ok(())
            }
            Err(e) => {
                tracing::error!(instance = %id, error = %e, "Provisioning failed");
                let _ = tokio::fs::remove_dir_all(layout.root()).await;
                self.set_status(InstanceStatus::Failed);
                Err(match e {
                    Error::Provisioning(_) => e,
                    other => Error::Provisioning(other.to_string()),
                })
            }
        }
    }

    /// Point the run at an already running instance. Replaces an earlier
    /// existing-mode attachment; a temporary instance owned by this run is
    /// never replaced.
    pub fn attach(&mut self, target: ExistingTarget) -> Result<()> {
        match &self.instance {
            None => {}
            Some(i) if i.kind == InstanceKind::Existing => {
                self.instance = None;
                self.metadata = None;
            }
            Some(_) => return Err(self.state_error("attach")),
        }
        match target {
            ExistingTarget::Url(url) => self.attach_url(&url),
            ExistingTarget::Id(id) => self.attach_id(&id),
        }
    }

    fn attach_url(&mut self, url: &str) -> Result<()> {
        validate_url(url).map_err(|e| Error::Provisioning(e.to_string()))?;
        let url = url.trim_end_matches('/').to_string();
        tracing::info!(url = %url, "Using existing instance");
        self.instance = Some(Instance {
            id: "existing".to_string(),
            kind: InstanceKind::Existing,
            status: InstanceStatus::Running,
            base_url: url.clone(),
            api_url: url,
            front_port: None,
            back_port: None,
            working_directory: None,
            created_at: Utc::now(),
        });
        Ok(())
    }

    fn attach_id(&mut self, id: &str) -> Result<()> {
        let metadata = InstanceMetadata::load_by_id(&self.instances_root, id)?;
        if metadata.live_pids().is_empty() && !metadata.processes.is_empty() {
            tracing::warn!(instance = %id, "None of the recorded server processes are alive");
        }
        tracing::info!(instance = %id, url = %metadata.base_url, "Reconnecting to existing instance");
        self.instance = Some(Instance {
            id: metadata.instance_id.clone(),
            kind: InstanceKind::Existing,
            status: InstanceStatus::Running,
            base_url: metadata.base_url.clone(),
            api_url: metadata.api_url.clone(),
            front_port: Some(metadata.front_port),
            back_port: Some(metadata.back_port),
            working_directory: Some(metadata.working_directory.clone()),
            created_at: metadata.created_at,
        });
        self.metadata = Some(metadata);
        Ok(())
    }

    fn set_status(&mut self, status: InstanceStatus) {
        if let Some(instance) = self.instance.as_mut() {
            instance.transition(status);
        }
    }

    /// Values the command and environment templates may reference.
    fn template_values(&self) -> HashMap<&'static str, String> {
        let mut values = HashMap::new();
        if let Some(instance) = &self.instance {
            values.insert("instance_id", instance.id.clone());
            values.insert("base_url", instance.base_url.clone());
            values.insert("api_url", instance.api_url.clone());
            if let Some(p) = instance.front_port {
                values.insert("front_port", p.to_string());
            }
            if let Some(p) = instance.back_port {
                values.insert("back_port", p.to_string());
            }
            if let Some(dir) = &instance.working_directory {
                values.insert("working_directory", dir.display().to_string());
            }
        }
        values
    }

    fn render(&self, text: &str) -> String {
        let values = self.template_values();
        Template::parse(text)
            .render(|name| values.get(name).cloned())
            .text
    }

    /// Like `render`, but values are shell-quoted for `bash -c`.
    fn render_command(&self, text: &str) -> String {
        let values = self.template_values();
        Template::parse(text)
            .render(|name| {
                values
                    .get(name)
                    .map(|v| shell_escape::escape(v.as_str().into()).into_owned())
            })
            .text
    }

    /// Environment for a server process of `role`.
    fn server_environment(&self, role: ServerRole) -> HashMap<String, String> {
        let mut env = HashMap::new();
        let Some(instance) = &self.instance else {
            return env;
        };
        let back = instance.back_port.map(|p| p.to_string()).unwrap_or_default();
        let front = instance.front_port.map(|p| p.to_string()).unwrap_or_default();
        let port = match role {
            ServerRole::Backend => back.clone(),
            ServerRole::Frontend => front.clone(),
        };

        env.insert("PORT".to_string(), port);
        env.insert("BACK_PORT".to_string(), back.clone());
        env.insert("API_PORT".to_string(), back);
        env.insert("FRONT_PORT".to_string(), front);
        env.insert("BASE_URL".to_string(), instance.base_url.clone());
        env.insert("API_URL".to_string(), instance.api_url.clone());
        env.insert("INSTANCE_ID".to_string(), instance.id.clone());
        env.insert("TEMP_INSTANCE".to_string(), "true".to_string());
        if let Some(dir) = &instance.working_directory {
            let layout = InstanceLayout::new(dir);
            env.insert("INSTANCE_DIR".to_string(), dir.display().to_string());
            env.insert("DATABASE_URL".to_string(), layout.database_url());
        }
        for (key, value) in &self.settings.environment {
            env.insert(key.clone(), self.render(value));
        }
        env
    }

    /// Spawn the servers and wait for them to answer.
    #[tracing::instrument(skip(self), fields(instance = %self.instance.as_ref().map(|i| i.id.as_str()).unwrap_or("-")))]
    pub async fn start(&mut self) -> Result<()> {
        let (id, dir, api_url, base_url) = match &self.instance {
            Some(i) if i.kind == InstanceKind::Temp && i.status == InstanceStatus::Ready => (
                i.id.clone(),
                i.working_directory.clone().unwrap_or_default(),
                i.api_url.clone(),
                i.base_url.clone(),
            ),
            Some(i) if i.kind == InstanceKind::Existing => {
                return Err(Error::InvalidInstanceState {
                    operation: "start".to_string(),
                    state: "existing".to_string(),
                })
            }
            _ => return Err(self.state_error("start")),
        };
        let logs_dir = InstanceLayout::new(&dir).logs_dir();

        let backend_cmd = self.render_command(self.settings.backend_command());
        let frontend_cmd = self
            .settings
            .frontend_command
            .as_deref()
            .map(|c| self.render_command(c));

        match self.spawn_servers(&dir, &logs_dir, &backend_cmd, frontend_cmd.as_deref()) {
            Ok(()) => {}
            Err(e) => {
                self.terminate_servers().await;
                self.set_status(InstanceStatus::Failed);
                return Err(e);
            }
        }
        self.record_processes(&backend_cmd, frontend_cmd.as_deref());

        let request_timeout = Duration::from_secs(2);
        let mut checks: Vec<Box<dyn ReadinessCheck>> = vec![Box::new(HttpProbe::new(
            join_url(&api_url, self.settings.health_path()),
            request_timeout,
        )?)];
        if frontend_cmd.is_some() {
            checks.push(Box::new(HttpProbe::new(
                join_url(&base_url, self.settings.frontend_path()),
                request_timeout,
            )?));
        }

        let timeout = self.settings.readiness_timeout();
        let backend = &mut self.backend;
        let frontend = &mut self.frontend;
        let outcome = wait_until_ready(&checks, timeout, self.settings.probe_interval(), || {
            for server in [backend.as_mut(), frontend.as_mut()].into_iter().flatten() {
                if let Some(status) = server.exit_status() {
                    return Some((server.role().name().to_string(), status));
                }
            }
            None
        })
        .await;

        match outcome {
            ReadinessOutcome::Ready => {
                self.set_status(InstanceStatus::Running);
                tracing::info!(instance = %id, url = %base_url, "Instance ready");
                Ok(())
            }
            ReadinessOutcome::TimedOut { pending } => {
                tracing::error!(instance = %id, ?pending, ?timeout, "Instance not ready before timeout");
                let log_tail = self.fail_start().await;
                Err(Error::ReadinessTimeout {
                    instance: id,
                    timeout,
                    log_tail,
                })
            }
            ReadinessOutcome::Exited { name, status } => {
                tracing::error!(instance = %id, process = %name, %status, "Server exited during start-up");
                let log_tail = self.fail_start().await;
                Err(Error::ProcessExited {
                    name,
                    status,
                    log_tail,
                })
            }
        }
    }

    fn spawn_servers(
        &mut self,
        dir: &Path,
        logs_dir: &Path,
        backend_cmd: &str,
        frontend_cmd: Option<&str>,
    ) -> Result<()> {
        let env = self.server_environment(ServerRole::Backend);
        self.backend = Some(ServerProcess::spawn(
            ServerRole::Backend,
            backend_cmd,
            dir,
            &env,
            LogPaths::for_role(logs_dir, ServerRole::Backend),
        )?);
        if let Some(cmd) = frontend_cmd {
            let env = self.server_environment(ServerRole::Frontend);
            self.frontend = Some(ServerProcess::spawn(
                ServerRole::Frontend,
                cmd,
                dir,
                &env,
                LogPaths::for_role(logs_dir, ServerRole::Frontend),
            )?);
        }
        Ok(())
    }

    fn record_processes(&mut self, backend_cmd: &str, frontend_cmd: Option<&str>) {
        let Some(metadata) = self.metadata.as_mut() else {
            return;
        };
        for (server, cmd) in [
            (self.backend.as_ref(), Some(backend_cmd)),
            (self.frontend.as_ref(), frontend_cmd),
        ] {
            let (Some(server), Some(cmd)) = (server, cmd) else {
                continue;
            };
            metadata.processes.insert(
                server.role().name().to_string(),
                RecordedProcess {
                    pid: server.pid(),
                    started_at: server.started_at(),
                    command: cmd.to_string(),
                },
            );
            for path in [&server.logs().stdout, &server.logs().stderr] {
                if let Some(name) = path.file_name() {
                    metadata
                        .logs
                        .insert(name.to_string_lossy().into_owned(), path.clone());
                }
            }
        }
        if let Err(e) = metadata.save() {
            tracing::warn!("Failed to update instance metadata: {}", e);
        }
    }

    /// Capture log tails, kill the servers and mark the instance failed.
    async fn fail_start(&mut self) -> String {
        // Give the servers a moment to flush what they printed before dying.
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.failure_tails = self.log_tails(DEFAULT_TAIL_LINES);
        self.terminate_servers().await;
        self.set_status(InstanceStatus::Failed);
        format_tails(&self.failure_tails)
    }

    async fn terminate_servers(&mut self) {
        let grace = self.settings.grace_period();
        for server in [self.frontend.as_mut(), self.backend.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = server.terminate(grace).await {
                tracing::warn!(role = server.role().name(), "Failed to stop server: {}", e);
            }
        }
        self.frontend = None;
        self.backend = None;
    }

    /// End this run's ownership of the instance.
    ///
    /// Temporary instances are torn down when `auto_cleanup` is set. Otherwise
    /// the servers keep running, the working directory stays, and the
    /// metadata file records that the instance was left behind. Existing
    /// instances are never touched. Calling `stop` again is a no-op.
    #[tracing::instrument(skip(self), fields(instance = %self.instance.as_ref().map(|i| i.id.as_str()).unwrap_or("-")))]
    pub async fn stop(&mut self, auto_cleanup: bool) -> Result<()> {
        let Some(instance) = self.instance.as_ref() else {
            return Ok(());
        };
        if instance.status == InstanceStatus::Stopped {
            return Ok(());
        }
        let failed = instance.status == InstanceStatus::Failed;
        let final_status = if failed {
            InstanceStatus::Failed
        } else {
            InstanceStatus::Stopped
        };

        if instance.kind == InstanceKind::Existing {
            self.set_status(final_status);
            return Ok(());
        }

        let dir = instance.working_directory.clone();
        if !failed {
            self.set_status(InstanceStatus::Stopping);
        }

        if auto_cleanup {
            self.terminate_servers().await;
            if let Some(dir) = dir {
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => tracing::info!(dir = %dir.display(), "Removed instance directory"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), "Failed to remove instance directory: {}", e);
                        self.set_status(final_status);
                        return Err(Error::Io(e));
                    }
                }
            }
        } else {
            // Dropping the handles leaves the process groups running.
            self.backend = None;
            self.frontend = None;
            if let Some(metadata) = self.metadata.as_mut() {
                metadata.auto_cleanup = false;
                if let Err(e) = metadata.save() {
                    tracing::warn!("Failed to update instance metadata: {}", e);
                }
            }
            if let Some(instance) = &self.instance {
                tracing::info!(
                    instance = %instance.id,
                    url = %instance.base_url,
                    dir = ?instance.working_directory,
                    "Leaving instance running (auto_cleanup disabled)"
                );
            }
        }

        self.set_status(final_status);
        Ok(())
    }

    /// Run the application's install command against the running instance.
    pub async fn install_app(
        &self,
        app_path: &Path,
        command: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let instance = match &self.instance {
            Some(i) if i.status == InstanceStatus::Running => i,
            _ => {
                return Err(Error::InstanceUnavailable(
                    "install_app needs a running instance".to_string(),
                ))
            }
        };
        if !app_path.is_dir() {
            return Err(Error::HandlerExecution(format!(
                "app path {} is not a directory",
                app_path.display()
            )));
        }

        let command = command.unwrap_or(self.settings.install_command());
        let mut env = HashMap::new();
        env.insert("BASE_URL".to_string(), instance.base_url.clone());
        env.insert("API_URL".to_string(), instance.api_url.clone());
        env.insert("INSTANCE_ID".to_string(), instance.id.clone());
        if let Some(dir) = &instance.working_directory {
            env.insert("INSTANCE_DIR".to_string(), dir.display().to_string());
        }

        tracing::info!(instance = %instance.id, app = %app_path.display(), command, "Installing app");
        run_shell_command(
            command,
            Some(app_path),
            &env,
            timeout.unwrap_or_else(|| self.settings.install_timeout()),
        )
        .await
    }

    /// Log files of the current instance, keyed by file name.
    pub fn log_files(&self) -> Vec<(String, PathBuf)> {
        let Some(dir) = self
            .instance
            .as_ref()
            .and_then(|i| i.working_directory.as_ref())
        else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(InstanceLayout::new(dir).logs_dir()) else {
            return Vec::new();
        };
        let mut files: Vec<(String, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "log"))
            .filter_map(|p| Some((p.file_name()?.to_string_lossy().into_owned(), p)))
            .collect();
        files.sort();
        files
    }

    pub fn log_tails(&self, lines: usize) -> BTreeMap<String, Vec<String>> {
        collect_tails(&self.log_files(), lines)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
