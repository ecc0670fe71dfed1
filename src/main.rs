use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "rollout")]
#[command(version, about = "Dependency-aware deploys for multi-service manifests")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Manifest path, relative to the project directory
    #[arg(long, default_value = "render.yaml", global = true)]
    pub manifest: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Where the set of changed files comes from.
#[derive(clap::Args, Clone, Debug, Default)]
pub struct ChangeArgs {
    /// Changed file, relative to the repository root (repeatable)
    #[arg(long = "changed", value_name = "PATH", conflicts_with = "base")]
    pub changed: Vec<String>,

    /// Git revision to diff from
    #[arg(long)]
    pub base: Option<String>,

    /// Git revision to diff to (defaults to the working tree)
    #[arg(long, requires = "base")]
    pub head: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check the manifest and its dependency graph
    Validate,
    /// Show build order and which services a change affects
    Plan {
        #[command(flatten)]
        changes: ChangeArgs,
    },
    /// Build and release every service in dependency order
    Deploy {
        #[command(flatten)]
        changes: ChangeArgs,

        /// Maximum concurrent builds. Overrides rollout.toml.
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Budget for the whole run in seconds. Overrides rollout.toml.
        #[arg(long)]
        run_timeout_secs: Option<u64>,

        /// Print the release report as JSON
        #[arg(long)]
        json: bool,

        /// Exit after the release report. Started processes stop with the
        /// command, so the next deploy rebuilds them.
        #[arg(long)]
        no_wait: bool,
    },
    /// Show or initialize rollout.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default rollout.toml file
    Init,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Validate => cmd::cmd_validate(&project_dir, &cli.manifest)?,
        Commands::Plan { changes } => cmd::cmd_plan(&project_dir, &cli.manifest, changes)?,
        Commands::Deploy {
            changes,
            max_parallel,
            run_timeout_secs,
            json,
            no_wait,
        } => {
            let options = cmd::DeployOptions {
                max_parallel: *max_parallel,
                run_timeout_secs: *run_timeout_secs,
                json: *json,
                no_wait: *no_wait,
            };
            let succeeded =
                cmd::cmd_deploy(project_dir, &cli.manifest, changes, options).await?;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
