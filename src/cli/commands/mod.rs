//! CLI command implementations

pub mod build;
pub mod publish;
mod services;

pub use build::{check, execute as build};
pub use publish::{execute as publish, export};
pub use services::create_services;

use crate::build::{run_with_cache_reset, BuildReport, Command, Conveyor, ConveyorOptions};
use crate::config::Config;
use crate::error::ConveyorResult;
use crate::stage::IntrospectOptions;
use console::{style, Emoji};
use std::path::{Path, PathBuf};

static BUILT: Emoji<'_, '_> = Emoji("⚙ ", "[BUILT] ");
static CACHED: Emoji<'_, '_> = Emoji("✓ ", "[CACHED] ");
static ARROW: Emoji<'_, '_> = Emoji("→ ", "-> ");

/// Options every command starts from
pub(crate) fn base_options(config: &Config) -> ConveyorOptions {
    let mut options = ConveyorOptions::new(&config.project.name);
    options.introspect = IntrospectOptions {
        before_error: config.build.introspect_before_error,
        after_error: config.build.introspect_after_error,
    };
    if config.build.ssh_agent {
        options.ssh_auth_sock = std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from);
    }
    options.renew = config.build.renew;
    options.images_repo = config.images_repo.address.clone();
    options.tagging = config.tagging.clone();
    options.export_templates = config.export.templates.clone();
    options.report_path = config.report.path.clone();
    options
}

/// Run `command` with cache-reset retries and print what happened
pub(crate) async fn run_command(
    config: &Config,
    project_dir: &Path,
    options: ConveyorOptions,
    command: Command,
) -> ConveyorResult<()> {
    let services = create_services(config, project_dir).await?;
    let cache = services.cache.clone();
    let conveyor = run_with_cache_reset(
        &cache,
        || Conveyor::new(&config.images, services.clone(), options.clone()),
        command,
    )
    .await?;
    if command != Command::CheckOnly {
        print_summary(conveyor.report());
    }
    Ok(())
}

fn print_summary(report: &BuildReport) {
    for (name, image) in &report.images {
        let marker = if image.rebuilt { &BUILT } else { &CACHED };
        println!(
            "{}{} {}",
            marker,
            style(name).cyan().bold(),
            style(&image.final_stage).dim()
        );
        for tag in &image.tags {
            println!("    {}{}", ARROW, tag);
        }
    }
}
