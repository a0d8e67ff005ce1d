//! Conveyor - content-addressed multi-stage image builds
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use conveyor::build::Command;
use conveyor::cli::{commands, Cli, Commands, LogFormat};
use conveyor::config::ConfigManager;
use conveyor::error::{ConveyorError, ConveyorResult};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            } else if e.is_retryable() {
                eprintln!("{} The failure may be transient, try again", style("Hint:").yellow());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> ConveyorResult<()> {
    let cli = Cli::parse();

    // 0 = warn, 1 = info (stage progress), 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("conveyor=warn"),
        1 => EnvFilter::new("conveyor=info"),
        _ => EnvFilter::new("conveyor=debug"),
    };
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;
    ConfigManager::ensure_state_dirs(&config).await?;

    let project_dir = match config_manager.path().parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => std::env::current_dir()
            .map_err(|e| ConveyorError::io("getting current directory", e))?,
    };
    debug!("Project directory: {}", project_dir.display());

    match cli.command {
        Commands::Build(args) => commands::build(args, &config, &project_dir).await,
        Commands::Check(args) => commands::check(args, &config, &project_dir).await,
        Commands::Tag(args) => commands::publish(args, Command::Tag, &config, &project_dir).await,
        Commands::Push(args) => commands::publish(args, Command::Push, &config, &project_dir).await,
        Commands::Publish(args) => {
            commands::publish(args, Command::Publish, &config, &project_dir).await
        }
        Commands::Export(args) => commands::export(args, &config, &project_dir).await,
    }
}
