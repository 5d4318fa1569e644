use crate::error::{Error, StepErrorKind};
use crate::variables::StepStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A session variable a handler asks to set. Applied by the dispatcher only
/// when the step succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableAssignment {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    /// `type/action` of the handler that failed.
    pub handler: String,
    pub message: String,
}

/// Recorded result of one step, in script order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: StepStatus,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

/// What a handler reports back for one step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, rename = "variables_to_set")]
    pub variables: Vec<VariableAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl StepResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// A handler-level failure (assertion miss, non-zero exit, bad status).
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(StepError {
                kind: StepErrorKind::HandlerExecution,
                handler: String::new(),
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    pub fn from_error(err: &Error, handler: &str) -> Self {
        Self {
            success: false,
            error: Some(StepError {
                kind: err.step_error_kind(),
                handler: handler.to_string(),
                message: err.to_string(),
            }),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_variable(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        description: &str,
    ) -> Self {
        self.variables.push(VariableAssignment {
            key: key.into(),
            value: value.into(),
            description: description.to_string(),
        });
        self
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}
