use super::{opt_bool, opt_str, require_str};
use crate::dispatch::{Handler, StepContext, StepResult};
use crate::error::{Error, Result};
use crate::variables::value_to_string;
use async_trait::async_trait;
use serde_json::Value;

/// Set several session variables from a `variables` mapping.
pub struct SetSessionVariables;

#[async_trait]
impl Handler for SetSessionVariables {
    async fn execute(&self, config: &Value, _ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let variables = match config.get("variables") {
            Some(Value::Object(map)) if !map.is_empty() => map,
            _ => return Ok(StepResult::failure("no variables specified")),
        };
        let mut result = StepResult::ok().with_data("count", variables.len());
        for (key, value) in variables {
            result = result.with_variable(key.as_str(), value_to_string(value), "Set from config");
        }
        Ok(result)
    }
}

/// Check that a session variable exists and matches expectations.
pub struct VerifySessionVariable;

#[async_trait]
impl Handler for VerifySessionVariable {
    async fn execute(&self, config: &Value, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let name = require_str(config, "variable")?;
        let not_empty = opt_bool(config, "not_empty").unwrap_or(true);
        let expected_type = opt_str(config, "expected_type").unwrap_or("string");

        let value = ctx.variables.get(name).unwrap_or_default();
        let result = StepResult::ok()
            .with_data("variable", name)
            .with_data("value", value)
            .with_data("exists", ctx.variables.contains(name));

        if value.is_empty() {
            return Ok(if not_empty {
                StepResult::failure(format!("variable '{}' is empty or not set", name))
                    .with_data("variable", name)
            } else {
                result
            });
        }

        match expected_type {
            "string" => {}
            "number" => {
                if value.trim().parse::<f64>().is_err() {
                    return Ok(StepResult::failure(format!(
                        "variable '{}' = '{}' is not a number",
                        name, value
                    )));
                }
            }
            other => {
                return Err(Error::HandlerExecution(format!(
                    "unsupported expected_type '{}'",
                    other
                )))
            }
        }

        if let Some(expected) = config.get("expected_value").filter(|v| !v.is_null()) {
            let expected = value_to_string(expected);
            if value != expected {
                return Ok(StepResult::failure(format!(
                    "variable '{}' = '{}', expected '{}'",
                    name, value, expected
                )));
            }
        }

        if let Some(needle) = opt_str(config, "contains") {
            if !value.contains(needle) {
                return Ok(StepResult::failure(format!(
                    "variable '{}' = '{}' does not contain '{}'",
                    name, value, needle
                )));
            }
        }

        tracing::info!(step = ctx.step_id, variable = name, "Session variable verified");
        Ok(result)
    }
}
