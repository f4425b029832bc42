use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "chati", version, about = "Concurrent agent execution engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct ProjectArgs {
    /// Project root (workers run here; chati.toml is read from here)
    #[arg(short, long)]
    pub project: Option<PathBuf>,

    /// Path to config file (overrides <project>/chati.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch a parallel group from a plan file and print the consolidated handoff
    Run {
        /// Plan file (TOML)
        #[arg(long)]
        plan: PathBuf,

        /// Role receiving the handoff (overrides the plan's next_role)
        #[arg(long)]
        next_role: Option<String>,

        /// Monitor poll interval in milliseconds
        #[arg(long)]
        poll_ms: Option<u64>,

        /// Default per-worker timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Check a plan's write scopes for conflicts without launching anything
    Check {
        /// Plan file (TOML)
        #[arg(long)]
        plan: PathBuf,

        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Print the effective write-scope table
    Scopes {
        /// Only show this role
        #[arg(long)]
        role: Option<String>,

        #[command(flatten)]
        project: ProjectArgs,
    },
}

impl Commands {
    pub fn project_args(&self) -> &ProjectArgs {
        match self {
            Commands::Run { project, .. }
            | Commands::Check { project, .. }
            | Commands::Scopes { project, .. } => project,
        }
    }
}
