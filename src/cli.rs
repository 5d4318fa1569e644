use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "srun")]
#[command(about = "Run declarative JSON test scripts against isolated application instances")]
pub struct Cli {
    /// Directory that receives one session directory per run
    #[arg(long, global = true, env = "SRUN_RUNS_DIR", default_value = "runs")]
    pub runs_dir: PathBuf,

    /// Directory holding temporary instance working directories
    #[arg(
        long,
        global = true,
        env = "SRUN_INSTANCES_DIR",
        default_value = "temp-instances"
    )]
    pub instances_dir: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a script
    Run {
        /// Path to the script JSON file
        script: PathBuf,
    },
    /// Parse and statically validate a script without running it
    Validate {
        /// Path to the script JSON file
        script: PathBuf,
    },
    /// Inspect or clean up instances left running by earlier runs
    #[command(subcommand)]
    Instances(InstancesCommands),
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum InstancesCommands {
    /// List persisted instances and whether their processes are alive
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop recorded processes and remove instance directories
    Clean {
        /// Instance ids to clean
        ids: Vec<String>,

        /// Clean every persisted instance
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },
}
