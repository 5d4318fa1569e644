//! Routing steps to handlers.
//!
//! Handlers register under a `(category, action)` key at startup. The
//! dispatcher resolves a step's templates, finds its handler and contains
//! every failure (missing handler, error, panic) in the returned
//! [`StepResult`], so one bad step never takes the runner down.

mod context;
mod result;

pub use context::{Artifact, ArtifactKind, ArtifactSink, StepContext};
pub use result::{StepError, StepOutcome, StepResult, VariableAssignment};

use crate::config::{InstanceMode, Settings, Step};
use crate::error::{Error, Result};
use crate::instance::InstanceSupervisor;
use crate::variables::VariableStore;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// The single capability every action implements.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Execute with an already template-resolved `config`.
    ///
    /// `Err` is reported as a failed step classified by the error variant;
    /// `Ok(StepResult::failure(..))` is a plain handler-level failure.
    async fn execute(&self, config: &Value, ctx: &mut StepContext<'_>) -> Result<StepResult>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey {
    pub category: String,
    pub action: String,
}

impl HandlerKey {
    pub fn new(category: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            action: action.into(),
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.action)
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<HandlerKey, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`; a second registration for the same key fails.
    pub fn register(
        &mut self,
        category: &str,
        action: &str,
        handler: impl Handler + 'static,
    ) -> Result<()> {
        let key = HandlerKey::new(category, action);
        if self.handlers.contains_key(&key) {
            return Err(Error::DuplicateHandler {
                category: key.category,
                action: key.action,
            });
        }
        self.handlers.insert(key, Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, category: &str, action: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .get(&HandlerKey::new(category, action))
            .cloned()
    }

    pub fn contains(&self, category: &str, action: &str) -> bool {
        self.handlers
            .contains_key(&HandlerKey::new(category, action))
    }

    pub fn keys(&self) -> impl Iterator<Item = &HandlerKey> {
        self.handlers.keys()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Everything `dispatch` needs from the runner for one step.
pub struct DispatchTarget<'a> {
    pub step: &'a Step,
    pub index: usize,
    pub variables: &'a mut VariableStore,
    pub supervisor: &'a mut InstanceSupervisor,
    pub settings: &'a Settings,
    pub artifacts: &'a ArtifactSink,
    /// Outcomes of the steps recorded so far.
    pub history: &'a [StepOutcome],
}

pub struct ActionDispatcher {
    registry: HandlerRegistry,
}

impl ActionDispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run one step and merge its variables on success. Never fails: every
    /// problem becomes a failed [`StepResult`].
    pub async fn dispatch(&self, target: DispatchTarget<'_>) -> StepResult {
        let DispatchTarget {
            step,
            index,
            variables,
            supervisor,
            settings,
            artifacts,
            history,
        } = target;
        let key = HandlerKey::new(step.step_type.as_str(), step.action());
        let handler_name = key.to_string();

        let Some(handler) = self.registry.get(&key.category, &key.action) else {
            tracing::warn!(step = %step.id, handler = %handler_name, "No handler registered");
            let err = Error::HandlerNotFound {
                category: key.category,
                action: key.action,
            };
            return StepResult::from_error(&err, &handler_name);
        };

        if step.is_instance_step() && settings.instance_mode() == InstanceMode::None {
            let err = Error::InstanceUnavailable(
                "instance steps need 'use_temp_instance' or 'use_existing_instance'".to_string(),
            );
            return StepResult::from_error(&err, &handler_name);
        }

        let (config, unresolved) = variables.resolve_value_with_report(&step.config);

        let outcome = {
            let mut ctx = StepContext {
                step_id: &step.id,
                step_index: index,
                variables: &*variables,
                supervisor: &mut *supervisor,
                settings,
                artifacts,
                history,
            };
            AssertUnwindSafe(handler.execute(&config, &mut ctx))
                .catch_unwind()
                .await
        };

        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => StepResult::from_error(&err, &handler_name),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(step = %step.id, handler = %handler_name, "Handler panicked: {}", message);
                StepResult::from_error(
                    &Error::HandlerExecution(format!("handler panicked: {}", message)),
                    &handler_name,
                )
            }
        };

        if let Some(error) = result.error.as_mut() {
            if error.handler.is_empty() {
                error.handler = handler_name.clone();
            }
        }
        if !result.success && result.error.is_none() {
            result.error = Some(StepError {
                kind: crate::error::StepErrorKind::HandlerExecution,
                handler: handler_name.clone(),
                message: "handler reported failure".to_string(),
            });
        }
        if !unresolved.is_empty() {
            result
                .data
                .insert("unresolved_templates".to_string(), unresolved.into());
        }

        if result.success {
            for assignment in &result.variables {
                variables.set_from_step(
                    assignment.key.as_str(),
                    assignment.value.as_str(),
                    &assignment.description,
                    &step.id,
                );
            }
        } else if !result.variables.is_empty() {
            tracing::debug!(
                step = %step.id,
                count = result.variables.len(),
                "Discarding variables from failed step"
            );
        }

        result
    }
}
