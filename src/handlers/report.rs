use super::{opt_bool, opt_str};
use crate::dispatch::{ArtifactKind, Handler, StepContext, StepOutcome, StepResult};
use crate::error::{Error, Result};
use crate::variables::{SessionVariable, StepStatus};
use async_trait::async_trait;
use chrono::Local;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};

const DEFAULT_TITLE: &str = "Test Report";
const DEFAULT_FILENAME: &str = "test_report.html";
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

const STYLE: &str = "\
body { font-family: Arial, sans-serif; margin: 20px; background: #f5f5f5; }
.container { max-width: 1200px; margin: 0 auto; background: #fff; padding: 20px; border-radius: 10px; }
.header { background: #667eea; color: #fff; padding: 20px; border-radius: 10px; text-align: center; }
.stats { display: grid; grid-template-columns: repeat(auto-fit, minmax(150px, 1fr)); gap: 15px; margin: 20px 0; }
.stat { border: 1px solid #e9ecef; border-radius: 8px; padding: 15px; text-align: center; }
.stat b { display: block; font-size: 2em; color: #667eea; }
.section { margin-bottom: 20px; padding: 15px; border-left: 4px solid #667eea; background: #f8f9ff; }
table { width: 100%; border-collapse: collapse; }
th, td { padding: 6px 10px; text-align: left; border-bottom: 1px solid #dee2e6; vertical-align: top; }
.succeeded { color: #28a745; } .failed { color: #dc3545; } .skipped { color: #6c757d; }
.shots { display: grid; grid-template-columns: repeat(auto-fit, minmax(250px, 1fr)); gap: 15px; }
.shots img { width: 100%; border: 1px solid #ddd; border-radius: 5px; }
code { font-family: monospace; background: #eef; padding: 1px 4px; }
";

/// Write an HTML summary of the session so far into the session directory.
pub struct GenerateHtmlReport;

impl GenerateHtmlReport {
    /// The report must land directly in the session directory.
    fn filename(config: &Value) -> Result<&str> {
        let name = opt_str(config, "filename").unwrap_or(DEFAULT_FILENAME);
        let plain = Path::new(name)
            .file_name()
            .is_some_and(|f| f == std::ffi::OsStr::new(name));
        if !plain || name == ".." {
            return Err(Error::HandlerExecution(format!(
                "report filename '{}' must be a plain file name",
                name
            )));
        }
        Ok(name)
    }
}

#[async_trait]
impl Handler for GenerateHtmlReport {
    async fn execute(&self, config: &Value, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let title = opt_str(config, "title").unwrap_or(DEFAULT_TITLE);
        let filename = Self::filename(config)?;
        let include_screenshots = opt_bool(config, "include_screenshots").unwrap_or(true);
        let include_variables = opt_bool(config, "include_variables").unwrap_or(true);

        let session_dir = ctx.artifacts.session_dir();
        let screenshots = list_screenshots(ctx.artifacts.screenshots_dir());
        let session_id = session_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let report = ReportInput {
            title,
            session_id: &session_id,
            steps: ctx.history,
            screenshots: if include_screenshots { &screenshots[..] } else { &[] },
            screenshot_count: screenshots.len(),
            variables: include_variables.then(|| ctx.variables.snapshot()),
            custom_sections: config.get("custom_sections"),
        };
        let html = render(&report);

        let path = session_dir.join(filename);
        tokio::fs::write(&path, &html).await?;
        ctx.record_artifact(ArtifactKind::Report, path.clone());
        tracing::info!(step = ctx.step_id, path = %path.display(), "HTML report written");

        Ok(StepResult::ok()
            .with_data("report_path", path.display().to_string())
            .with_data("size_bytes", html.len())
            .with_data("steps_reported", ctx.history.len())
            .with_data("screenshot_count", screenshots.len()))
    }
}

struct ReportInput<'a> {
    title: &'a str,
    session_id: &'a str,
    steps: &'a [StepOutcome],
    screenshots: &'a [PathBuf],
    screenshot_count: usize,
    variables: Option<BTreeMap<String, SessionVariable>>,
    custom_sections: Option<&'a Value>,
}

/// Image files in the screenshots directory, by name.
fn list_screenshots(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    files
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn status_class(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Succeeded => "succeeded",
        StepStatus::Failed => "failed",
        StepStatus::Skipped => "skipped",
    }
}

// Writing into a String cannot fail, so the fmt results are discarded.
fn render(input: &ReportInput<'_>) -> String {
    let count = |status: StepStatus| input.steps.iter().filter(|s| s.status == status).count();
    let mut html = String::new();

    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n\
         <title>{title}</title>\n<style>\n{STYLE}</style>\n</head>\n<body>\n<div class=\"container\">\n\
         <div class=\"header\">\n<h1>{title}</h1>\n<p><strong>Generated:</strong> {generated}</p>\n\
         <p><strong>Session:</strong> {session}</p>\n</div>\n",
        title = escape(input.title),
        generated = Local::now().format("%Y-%m-%d %H:%M:%S"),
        session = escape(input.session_id),
    );

    html.push_str("<div class=\"stats\">\n");
    for (label, value) in [
        ("Steps", input.steps.len()),
        ("Succeeded", count(StepStatus::Succeeded)),
        ("Failed", count(StepStatus::Failed)),
        ("Skipped", count(StepStatus::Skipped)),
        ("Screenshots", input.screenshot_count),
    ] {
        let _ = writeln!(html, "<div class=\"stat\"><b>{}</b>{}</div>", value, label);
    }
    html.push_str("</div>\n");

    html.push_str("<div class=\"section\">\n<h2>Steps</h2>\n");
    if input.steps.is_empty() {
        html.push_str("<p>No steps recorded yet.</p>\n");
    } else {
        html.push_str(
            "<table>\n<tr><th>#</th><th>Step</th><th>Action</th><th>Status</th><th>Duration</th><th>Details</th></tr>\n",
        );
        for step in input.steps {
            let details = match (&step.error, &step.description) {
                (Some(error), _) => format!("[{}] {}", error.handler, error.message),
                (None, Some(description)) => description.clone(),
                (None, None) => String::new(),
            };
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td><code>{}</code></td><td>{}/{}</td>\
                 <td class=\"{class}\">{class}</td><td>{} ms</td><td>{}</td></tr>",
                step.index + 1,
                escape(&step.id),
                escape(&step.step_type),
                escape(&step.action),
                step.duration_ms,
                escape(&details),
                class = status_class(step.status),
            );
        }
        html.push_str("</table>\n");
    }
    html.push_str("</div>\n");

    if let Some(variables) = input.variables.as_ref().filter(|v| !v.is_empty()) {
        html.push_str(
            "<div class=\"section\">\n<h2>Session Variables</h2>\n<table>\n\
             <tr><th>Name</th><th>Value</th><th>Set by</th></tr>\n",
        );
        for (key, variable) in variables {
            let _ = writeln!(
                html,
                "<tr><td><code>{}</code></td><td>{}</td><td>{}</td></tr>",
                escape(key),
                escape(&variable.value),
                escape(variable.step.as_deref().unwrap_or("-")),
            );
        }
        html.push_str("</table>\n</div>\n");
    }

    if !input.screenshots.is_empty() {
        html.push_str("<div class=\"section\">\n<h2>Screenshots</h2>\n<div class=\"shots\">\n");
        for shot in input.screenshots {
            let name = shot
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let _ = writeln!(
                html,
                "<figure><a href=\"screenshots/{src}\"><img src=\"screenshots/{src}\" alt=\"{src}\"></a>\
                 <figcaption>{src}</figcaption></figure>",
                src = escape(&name),
            );
        }
        html.push_str("</div>\n</div>\n");
    }

    // Section bodies are HTML supplied by the script author.
    if let Some(Value::Object(sections)) = input.custom_sections {
        for (heading, body) in sections {
            let body = match body {
                Value::String(s) => s.clone(),
                other => format!("<pre>{}</pre>", escape(&other.to_string())),
            };
            let _ = writeln!(
                html,
                "<div class=\"section\">\n<h2>{}</h2>\n{}\n</div>",
                escape(heading),
                body
            );
        }
    }

    html.push_str("</div>\n</body>\n</html>\n");
    html
}
