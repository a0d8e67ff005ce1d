//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Conveyor - content-addressed multi-stage image builds
///
/// Builds the images declared in conveyor.toml stage by stage, reusing
/// every stage artifact whose inputs did not change.
#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "CONVEYOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build missing stages of the declared images
    Build(BuildArgs),

    /// Fail if any stage would have to be built
    Check(CheckArgs),

    /// Tag final images locally
    Tag(PublishArgs),

    /// Push final images tagged by content signature
    Push(PublishArgs),

    /// Push final images under every configured tag
    Publish(PublishArgs),

    /// Push final images to arbitrary references
    Export(ExportArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Images to build (defaults to all; bases are included)
    pub images: Vec<String>,

    /// Open a shell in the stage's base image when a build fails
    #[arg(long)]
    pub introspect_before_error: bool,

    /// Open a shell with the failed stage's commands replayed
    #[arg(long)]
    pub introspect_error: bool,

    /// Evict stale stage artifacts before building
    #[arg(long)]
    pub renew: bool,

    /// Write a JSON build report to this path
    #[arg(long)]
    pub report: Option<PathBuf>,
}

/// Arguments for the check command
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Images to check (defaults to all)
    pub images: Vec<String>,
}

/// Arguments for the tag, push and publish commands
#[derive(Parser, Debug)]
pub struct PublishArgs {
    /// Images to publish (defaults to all)
    pub images: Vec<String>,

    /// Custom tag (repeatable)
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Final images repository (overrides images_repo.address)
    #[arg(long, env = "CONVEYOR_IMAGES_REPO")]
    pub repo: Option<String>,

    /// Fail instead of building missing stages
    #[arg(long)]
    pub require_built: bool,

    /// Write a JSON build report to this path
    #[arg(long)]
    pub report: Option<PathBuf>,
}

/// Arguments for the export command
#[derive(Parser, Debug)]
pub struct ExportArgs {
    /// Images to export (defaults to all)
    pub images: Vec<String>,

    /// Target reference, `%image%` expands to the image name (repeatable)
    #[arg(long = "to", required = true)]
    pub templates: Vec<String>,

    /// Fail instead of building missing stages
    #[arg(long)]
    pub require_built: bool,
}
