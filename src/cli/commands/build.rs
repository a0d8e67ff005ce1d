//! Build and check commands

use super::{base_options, run_command};
use crate::build::Command;
use crate::cli::args::{BuildArgs, CheckArgs};
use crate::config::Config;
use crate::error::ConveyorResult;
use console::style;
use std::path::Path;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config, project_dir: &Path) -> ConveyorResult<()> {
    let mut options = base_options(config);
    options.images = args.images;
    options.introspect.before_error |= args.introspect_before_error;
    options.introspect.after_error |= args.introspect_error;
    options.renew |= args.renew;
    if args.report.is_some() {
        options.report_path = args.report;
    }
    run_command(config, project_dir, options, Command::Build).await
}

/// Execute the check command
pub async fn check(args: CheckArgs, config: &Config, project_dir: &Path) -> ConveyorResult<()> {
    let mut options = base_options(config);
    options.images = args.images;
    options.report_path = None;
    run_command(config, project_dir, options, Command::CheckOnly).await?;
    println!("{}", style("All stages are built").green().bold());
    Ok(())
}
