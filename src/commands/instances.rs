use crate::output::UserOutput;
use script_runner::instance::InstanceReaper;
use serde_json::json;
use std::path::Path;

pub fn run_instances_list(
    instances_root: &Path,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let summaries = InstanceReaper::new(instances_root).list()?;

    if json {
        let items: Vec<_> = summaries
            .iter()
            .map(|s| {
                json!({
                    "instance": s.metadata,
                    "live_pids": s.live_pids,
                    "running": s.is_running(),
                })
            })
            .collect();
        out.status(&serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if summaries.is_empty() {
        out.status(&format!("No instances under {}", instances_root.display()));
        return Ok(());
    }

    out.status("Instances:");
    out.status(&format!("{:-<70}", ""));
    for summary in &summaries {
        let m = &summary.metadata;
        let icon = if summary.is_running() { "+" } else { "o" };
        out.status(&format!(
            "  {} {:<40} {} (ports {}/{})",
            icon, m.instance_id, m.base_url, m.front_port, m.back_port
        ));
        out.status(&format!("      dir: {}", m.working_directory.display()));
        if summary.is_running() {
            out.status(&format!("      live pids: {:?}", summary.live_pids));
        }
    }
    Ok(())
}

pub async fn run_instances_clean(
    instances_root: &Path,
    ids: &[String],
    all: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    if ids.is_empty() && !all {
        anyhow::bail!("Name the instances to clean or pass --all");
    }

    let reports = InstanceReaper::new(instances_root).clean(ids).await?;
    if reports.is_empty() {
        out.status("Nothing to clean");
        return Ok(());
    }

    let mut failed = 0;
    for report in &reports {
        if report.errors.is_empty() {
            out.success(&format!(
                "Cleaned {} (signalled {} process(es), directory {})",
                report.instance_id,
                report.signalled.len(),
                if report.removed_dir { "removed" } else { "already gone" }
            ));
        } else {
            failed += 1;
            for error in &report.errors {
                out.error(&format!("{}: {}", report.instance_id, error));
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} instance(s) could not be fully cleaned", failed);
    }
    Ok(())
}
