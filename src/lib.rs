#![allow(unused_assignments)]

//! # Script Runner
//!
//! Executes declarative JSON test scripts step by step against an isolated
//! application instance.
//!
//! ## Features
//!
//! - **Session Variables**: Values captured by one step feed later steps through `{{name}}` templates
//! - **Template Language**: `{{name}}`, `{{ENV:NAME}}` and builtins like `{{$timestamp}}` and `{{$random_hex:12}}`, resolved in a single non-recursive pass
//! - **Temporary Instances**: Fresh ports, working directory and server processes per run, with HTTP readiness probing
//! - **Existing Instances**: Point a run at a URL, or reconnect to an instance an earlier run left running
//! - **Pluggable Handlers**: Steps route to handlers registered under `(type, action)`
//! - **Run Manifests**: Every run writes an ordered step log, artifacts and variables to `manifest.json`
//!
//! ## Quick Start
//!
//! ```no_run
//! use script_runner::{RunnerOptions, ScriptRunner};
//!
//! # async fn example() -> Result<(), script_runner::Error> {
//! let runner = ScriptRunner::new(RunnerOptions::default())?;
//! let outcome = runner.run_file("scripts/login.json").await?;
//!
//! println!("{} -> {}", outcome.session_dir.display(), outcome.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Execution Model
//!
//! - Steps run strictly in order on one task; there is no intra-run parallelism
//! - Handlers never write the variable store; the dispatcher merges their variables on success
//! - A failed step aborts the run unless it sets `continue_on_error`
//! - Finalization (log capture, instance teardown, manifest) runs exactly once per run

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod instance;
pub mod port;
pub mod runner;
pub mod variables;

// Re-export commonly used types
pub use config::{Parser, Script, Settings, Step};
pub use dispatch::{ActionDispatcher, Handler, HandlerRegistry, StepContext, StepResult};
pub use error::{Error, Result};
pub use instance::{InstanceSupervisor, ProvisionMode};
pub use port::PortAllocator;
pub use runner::{RunOutcome, RunState, RunStatus, RunnerOptions, ScriptRunner};
pub use variables::VariableStore;
