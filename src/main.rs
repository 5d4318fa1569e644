mod cli;
mod commands;
mod output;

use clap::{CommandFactory, Parser};
use cli::{Cli, Commands, InstancesCommands};
use script_runner::runner::RunnerOptions;
use script_runner::Error as RunnerError;

/// Exit code for scripts that fail to load or validate.
const EXIT_INVALID: i32 = 2;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if let Some(runner_error) = e.downcast_ref::<RunnerError>() {
                eprintln!("Error: {}", runner_error);
                if let Some(suggestion) = runner_error.suggestion() {
                    eprintln!("\nHint: {}", suggestion);
                }
            } else {
                eprintln!("Error: {:#}", e);
            }
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let options = RunnerOptions {
        runs_root: cli.runs_dir.clone(),
        instances_root: cli.instances_dir.clone(),
    };

    match &cli.command {
        Commands::Run { script } => {
            let completed = commands::run_script(script, options, &output::CliOutput).await?;
            Ok(if completed { 0 } else { 1 })
        }
        Commands::Validate { script } => {
            let valid = commands::run_validate(script, &output::CliOutput)?;
            Ok(if valid { 0 } else { EXIT_INVALID })
        }
        Commands::Instances(InstancesCommands::List { json }) => {
            commands::run_instances_list(&cli.instances_dir, *json, &output::CliOutput)?;
            Ok(0)
        }
        Commands::Instances(InstancesCommands::Clean { ids, all }) => {
            commands::run_instances_clean(&cli.instances_dir, ids, *all, &output::CliOutput)
                .await?;
            Ok(0)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(*shell, &mut cmd, bin_name, &mut std::io::stdout());
            Ok(0)
        }
    }
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let fallback = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
