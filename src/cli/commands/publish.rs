//! Tag, push, publish and export commands

use super::{base_options, run_command};
use crate::build::Command;
use crate::cli::args::{ExportArgs, PublishArgs};
use crate::config::Config;
use crate::error::ConveyorResult;
use std::path::Path;

/// Execute tag, push or publish
pub async fn execute(
    args: PublishArgs,
    command: Command,
    config: &Config,
    project_dir: &Path,
) -> ConveyorResult<()> {
    let mut options = base_options(config);
    options.images = args.images;
    options.require_built = args.require_built;
    options.tagging.custom.extend(args.tags);
    if args.repo.is_some() {
        options.images_repo = args.repo;
    }
    if args.report.is_some() {
        options.report_path = args.report;
    }
    run_command(config, project_dir, options, command).await
}

/// Execute the export command
pub async fn export(args: ExportArgs, config: &Config, project_dir: &Path) -> ConveyorResult<()> {
    let mut options = base_options(config);
    options.images = args.images;
    options.require_built = args.require_built;
    options.export_templates = args.templates;
    run_command(config, project_dir, options, Command::Export).await
}
