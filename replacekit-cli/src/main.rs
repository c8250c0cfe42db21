use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use replacekit::ReplaceConfig;

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "replacekit")]
#[command(author, version, about, long_about = None)]
#[command(
    about = "Rule-based batch find-and-replace over session file sets",
    long_about = "Validates rule documents (literal and regex rules, with backtracking checks), \
                  applies them across every text file of a session directory and reports \
                  per-file and per-rule statistics."
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short = 'f', long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Config file to use instead of the global/project lookup
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a rule document without touching any file
    Validate {
        /// Rule document path
        rules: PathBuf,
    },

    /// Show how a rule document is parsed
    Parse {
        /// Rule document path
        rules: PathBuf,
    },

    /// Apply a rule document to every file of a session
    Run {
        /// Rule document path
        rules: PathBuf,

        /// Directory holding one sub-directory per session
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Session (sub-directory of root) to process
        #[arg(short, long)]
        session: String,

        /// Show the changes without writing them
        #[arg(long)]
        preview: bool,

        /// File workers (clamped to 1-4)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Write a config file populated with the defaults
    InitConfig {
        /// Destination (defaults to ./replacekit.toml)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ReplaceConfig> {
    match path {
        Some(path) => ReplaceConfig::load_from_file(path),
        None => ReplaceConfig::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    replacekit::logging::init(cli.verbose);

    match cli.command {
        Commands::Validate { rules } => {
            let config = load_config(cli.config.as_ref())?;
            commands::validate::run(rules, &config, &cli.format)?
        }
        Commands::Parse { rules } => commands::parse::run(rules, &cli.format)?,
        Commands::Run {
            rules,
            root,
            session,
            preview,
            workers,
        } => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(workers) = workers {
                config.orchestrator.workers = workers;
            }
            tracing::debug!(
                "Running with {} file worker(s), rule timeout {:?}",
                config.orchestrator.effective_workers(),
                config.engine.rule_timeout()
            );
            commands::run::run(rules, root, session, preview, config, &cli.format).await?
        }
        Commands::InitConfig { path, force } => commands::init_config::run(path, force)?,
    }

    Ok(())
}
