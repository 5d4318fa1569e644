use super::{opt_bool, opt_duration, opt_str, require_str};
use crate::dispatch::{Handler, StepContext, StepResult};
use crate::error::{Error, Result};
use crate::instance::logs::scan_for_errors;
use crate::instance::process::run_shell_command;
use crate::instance::readiness::shared_client;
use crate::variables::value_to_string;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::{Duration, Instant};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_MATCHES: usize = 10;

/// Environment every command sees about the current instance.
fn instance_environment(ctx: &StepContext<'_>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(instance) = ctx.instance() {
        env.insert("BASE_URL".to_string(), instance.base_url.clone());
        env.insert("API_URL".to_string(), instance.api_url.clone());
        env.insert("INSTANCE_ID".to_string(), instance.id.clone());
        if let Some(dir) = &instance.working_directory {
            env.insert("INSTANCE_DIR".to_string(), dir.display().to_string());
        }
    }
    env
}

fn string_map(value: Option<&Value>) -> Vec<(String, String)> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect(),
        _ => Vec::new(),
    }
}

fn expected_exit_code(config: &Value) -> Result<i32> {
    match config.get("expect_exit_code") {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| Error::HandlerExecution(format!("invalid expect_exit_code {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| Error::HandlerExecution(format!("invalid expect_exit_code '{}'", s))),
        Some(other) => Err(Error::HandlerExecution(format!(
            "invalid expect_exit_code {}",
            other
        ))),
    }
}

/// Run a shell command and check its exit code.
pub struct RunCommand;

#[async_trait]
impl Handler for RunCommand {
    async fn execute(&self, config: &Value, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let command = require_str(config, "command")?;
        let timeout = opt_duration(config, "timeout", DEFAULT_COMMAND_TIMEOUT);
        let work_dir = opt_str(config, "working_directory").map(Path::new);
        let expected = expected_exit_code(config)?;

        let mut env = instance_environment(ctx);
        env.extend(string_map(config.get("environment")));

        tracing::info!(step = ctx.step_id, command, "Running command");
        let started = Instant::now();
        let output = run_shell_command(command, work_dir, &env, timeout)
            .await
            .map_err(|e| match e {
                Error::ProcessSpawn { .. } => Error::HandlerExecution(e.to_string()),
                other => other,
            })?;
        let elapsed = started.elapsed();

        let result = if output.exit_code == Some(expected) {
            let mut ok = StepResult::ok();
            if let Some(name) = opt_str(config, "capture_as") {
                ok = ok.with_variable(name, output.stdout.trim(), "Captured command output");
            }
            ok
        } else {
            StepResult::failure(format!(
                "command exited with {}, expected {}",
                output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "a signal".to_string()),
                expected
            ))
        };
        Ok(result
            .with_data("command", command)
            .with_data("exit_code", output.exit_code)
            .with_data("stdout", output.stdout)
            .with_data("stderr", output.stderr)
            .with_data("duration_ms", elapsed.as_millis() as u64))
    }
}

/// Issue one HTTP request and check its status.
pub struct ApiTest;

impl ApiTest {
    fn expected_statuses(config: &Value) -> Result<Vec<u16>> {
        let parse = |v: &Value| -> Option<u16> {
            match v {
                Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
        };
        match config.get("expected_status") {
            None | Some(Value::Null) => Ok(vec![200]),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    parse(v).ok_or_else(|| {
                        Error::HandlerExecution(format!("invalid expected_status {}", v))
                    })
                })
                .collect(),
            Some(v) => parse(v)
                .map(|s| vec![s])
                .ok_or_else(|| Error::HandlerExecution(format!("invalid expected_status {}", v))),
        }
    }

    /// Paths starting with `/` are relative to the instance's API URL.
    fn target_url(config: &Value, ctx: &StepContext<'_>) -> Result<String> {
        let url = require_str(config, "url")?;
        if url.starts_with('/') {
            let instance = ctx.require_instance()?;
            return Ok(format!("{}{}", instance.api_url.trim_end_matches('/'), url));
        }
        Ok(url.to_string())
    }
}

#[async_trait]
impl Handler for ApiTest {
    async fn execute(&self, config: &Value, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let method_name = opt_str(config, "method").unwrap_or("GET").to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| Error::HandlerExecution(format!("invalid HTTP method '{}'", method_name)))?;
        let url = Self::target_url(config, ctx)?;
        let expected = Self::expected_statuses(config)?;
        let timeout = opt_duration(config, "timeout", DEFAULT_API_TIMEOUT);

        let mut request = shared_client().request(method, &url).timeout(timeout);
        for (name, value) in string_map(config.get("headers")) {
            request = request.header(name, value);
        }
        match config.get("json") {
            None | Some(Value::Null) => {}
            Some(body) => request = request.json(body),
        }
        match config.get("data") {
            Some(Value::String(body)) => request = request.body(body.clone()),
            Some(Value::Object(_)) => {
                let form: BTreeMap<String, String> =
                    string_map(config.get("data")).into_iter().collect();
                request = request.form(&form);
            }
            _ => {}
        }

        tracing::info!(step = ctx.step_id, method = %method_name, url = %url, "API request");
        let started = Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::HandlerExecution(format!("request to {} timed out after {:?}", url, timeout))
            } else {
                Error::Http(e)
            }
        })?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        let elapsed = started.elapsed();

        let result = if expected.contains(&status) {
            let mut ok = StepResult::ok();
            if let Some(name) = opt_str(config, "capture_as") {
                ok = ok.with_variable(name, body.as_str(), "Captured API response");
            }
            ok
        } else {
            StepResult::failure(format!(
                "{} {} returned {}, expected {}",
                method_name,
                url,
                status,
                expected
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(" or ")
            ))
        };
        let body_value = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));
        Ok(result
            .with_data("method", method_name.as_str())
            .with_data("url", url)
            .with_data("status", status)
            .with_data("body", body_value)
            .with_data("duration_ms", elapsed.as_millis() as u64))
    }
}

/// Scan the instance's server logs for error markers.
pub struct AnalyzeServerLogs;

#[async_trait]
impl Handler for AnalyzeServerLogs {
    async fn execute(&self, config: &Value, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let fail_on_errors = opt_bool(config, "fail_on_errors").unwrap_or(false);
        let max_matches = config
            .get("max_matches")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_MATCHES);

        let files = ctx.supervisor.log_files();
        let mut counts = Map::new();
        let mut matches = Vec::new();
        let mut total = 0;
        for (name, path) in &files {
            let found = scan_for_errors(path, max_matches);
            total += found.total;
            counts.insert(name.clone(), found.total.into());
            matches.extend(
                found
                    .recent
                    .into_iter()
                    .map(|(line, text)| format!("{}:{}: {}", name, line, text)),
            );
        }
        let recent: Vec<String> = matches.split_off(matches.len().saturating_sub(max_matches));

        if total > 0 {
            tracing::warn!(step = ctx.step_id, errors = total, "Errors found in server logs");
        }
        let result = if fail_on_errors && total > 0 {
            StepResult::failure(format!("{} error line(s) found in server logs", total))
        } else {
            StepResult::ok()
        };
        Ok(result
            .with_data("files_scanned", files.len())
            .with_data("error_count", total)
            .with_data("errors_by_file", counts)
            .with_data("recent_errors", recent))
    }
}
