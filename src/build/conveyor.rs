//! The conveyor: images plus the phase pipeline that builds them

use super::image::{order_images, select_images, Image};
use super::phase::{
    BuildPhase, CheckOnlyPhase, Phase, PreparePhase, PublishMode, PublishPhase, RenewPhase,
    SignaturesPhase,
};
use super::report::BuildReport;
use super::tagging::TaggingOptions;
use crate::config::ImageDeclaration;
use crate::engine::ContainerEngine;
use crate::error::{ConveyorError, ConveyorResult};
use crate::git::GitRepo;
use crate::lock::LockManager;
use crate::registry::Registry;
use crate::signature::{Signature, CACHE_FORMAT_VERSION};
use crate::stage::{IntrospectOptions, StageEnv};
use crate::storage::{ImageInfo, StagesStorage, StagesStorageCache};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Collaborators shared by every run of a command
#[derive(Clone)]
pub struct ConveyorServices {
    pub engine: Arc<dyn ContainerEngine>,
    pub storage: Arc<dyn StagesStorage>,
    /// Outlives conveyors; only the retry wrapper clears it
    pub cache: Arc<StagesStorageCache>,
    pub locks: LockManager,
    pub git: Option<Arc<dyn GitRepo>>,
    /// Registry of the final images repository
    pub images_registry: Option<Arc<dyn Registry>>,
}

/// Per-command settings
#[derive(Debug, Clone)]
pub struct ConveyorOptions {
    pub project: String,
    pub cache_version: String,
    pub introspect: IntrospectOptions,
    /// Host agent socket forwarded into instruction stages
    pub ssh_auth_sock: Option<PathBuf>,
    pub renew: bool,
    /// Restrict the run to these images (and their bases)
    pub images: Vec<String>,
    /// Fail instead of building missing stages
    pub require_built: bool,
    /// Final images repository
    pub images_repo: Option<String>,
    pub tagging: TaggingOptions,
    pub export_templates: Vec<String>,
    pub report_path: Option<PathBuf>,
}

impl ConveyorOptions {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            cache_version: CACHE_FORMAT_VERSION.to_string(),
            introspect: IntrospectOptions::default(),
            ssh_auth_sock: None,
            renew: false,
            images: Vec::new(),
            require_built: false,
            images_repo: None,
            tagging: TaggingOptions::default(),
            export_templates: Vec::new(),
            report_path: None,
        }
    }
}

/// Top-level operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Build,
    CheckOnly,
    Tag,
    Push,
    Publish,
    Export,
}

impl Command {
    fn publish_mode(&self) -> Option<PublishMode> {
        match self {
            Self::Build | Self::CheckOnly => None,
            Self::Tag => Some(PublishMode::Tag),
            Self::Push => Some(PublishMode::Push),
            Self::Publish => Some(PublishMode::Publish),
            Self::Export => Some(PublishMode::Export),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::CheckOnly => "check",
            Self::Tag => "tag",
            Self::Push => "push",
            Self::Publish => "publish",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared by the phases of one run
pub struct BuildContext {
    pub services: ConveyorServices,
    pub options: ConveyorOptions,
    /// Artifacts bound in this run, by stage signature
    pub artifacts: HashMap<Signature, ImageInfo>,
    /// Last stage signature of each image, by image name
    pub final_signatures: HashMap<String, Signature>,
    pub report: BuildReport,
}

impl BuildContext {
    pub fn new(services: ConveyorServices, options: ConveyorOptions) -> Self {
        let report = BuildReport::new(&options.project, "pending");
        Self {
            services,
            options,
            artifacts: HashMap::new(),
            final_signatures: HashMap::new(),
            report,
        }
    }

    /// Final artifact of the declared image `name`, if bound
    pub fn image_artifact(&self, name: Option<&str>) -> Option<&ImageInfo> {
        let signature = self.final_signatures.get(name?)?;
        self.artifacts.get(signature)
    }

    /// Stage environment for one position in an image's chain
    pub fn stage_env<'a>(
        &'a self,
        base_image: Option<&'a str>,
        previous: Option<&'a ImageInfo>,
        git_commit: Option<&'a str>,
    ) -> StageEnv<'a> {
        StageEnv {
            project: &self.options.project,
            cache_version: &self.options.cache_version,
            engine: self.services.engine.as_ref(),
            git: self.services.git.as_deref(),
            previous,
            git_commit,
            base_image_signature: base_image.and_then(|name| self.final_signatures.get(name)),
        }
    }

    /// Make a bound artifact available to the local engine.
    ///
    /// An artifact that vanished from storage since it was looked up means
    /// the cache is stale, so the whole run has to start over.
    pub async fn fetch(&self, artifact: &ImageInfo) -> ConveyorResult<ImageInfo> {
        match self.services.storage.fetch(artifact).await {
            Err(ConveyorError::StageMissing { name, storage }) => Err(
                ConveyorError::should_reset_cache(format!("{} vanished from {}", name, storage)),
            ),
            other => other,
        }
    }

    /// Local artifact of the final stage of the declared image `name`
    pub async fn fetch_image(&self, name: &str) -> ConveyorResult<ImageInfo> {
        let artifact = self
            .image_artifact(Some(name))
            .ok_or_else(|| ConveyorError::Internal(format!("image {} is not built", name)))?;
        self.fetch(artifact).await
    }
}

/// Images of one project and the pipeline that builds them.
///
/// A conveyor serves a single run; the retry wrapper builds a fresh one
/// after a cache reset.
pub struct Conveyor {
    images: Vec<Image>,
    ctx: BuildContext,
}

impl Conveyor {
    pub fn new(
        declarations: &[ImageDeclaration],
        services: ConveyorServices,
        options: ConveyorOptions,
    ) -> ConveyorResult<Self> {
        let images = declarations
            .iter()
            .map(Image::from_declaration)
            .collect::<ConveyorResult<Vec<_>>>()?;
        let images = select_images(order_images(images)?, &options.images)?;

        if services.git.is_none() {
            let git_stage = images.iter().find_map(|image| {
                image
                    .stages
                    .iter()
                    .find(|s| s.spec.uses_git())
                    .map(|s| format!("{}/{}", image.log_name(), s.name()))
            });
            if let Some(stage) = git_stage {
                return Err(ConveyorError::GitRepoMissing(stage));
            }
        }

        Ok(Self {
            images,
            ctx: BuildContext::new(services, options),
        })
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn context(&self) -> &BuildContext {
        &self.ctx
    }

    /// Phases run for `command`, in order
    pub fn phases(&self, command: Command) -> Vec<Box<dyn Phase>> {
        let mut phases: Vec<Box<dyn Phase>> = vec![Box::new(SignaturesPhase)];
        if self.ctx.options.renew && command != Command::CheckOnly {
            phases.push(Box::new(RenewPhase::default()));
        }
        if command == Command::CheckOnly || self.ctx.options.require_built {
            phases.push(Box::new(CheckOnlyPhase::default()));
        } else {
            phases.push(Box::new(PreparePhase));
            phases.push(Box::new(BuildPhase));
        }
        if let Some(mode) = command.publish_mode() {
            phases.push(Box::new(PublishPhase::new(mode)));
        }
        phases
    }

    /// Run the pipeline for `command` and write the report
    pub async fn run(&mut self, command: Command) -> ConveyorResult<()> {
        info!("Running {} for project {}", command, self.ctx.options.project);
        self.ctx.report.command = command.to_string();
        let phases = self.phases(command);
        self.run_phases(phases).await?;

        self.record_report();
        if let Some(path) = self.ctx.options.report_path.clone() {
            self.ctx.report.write(&path).await?;
        }
        Ok(())
    }

    /// Run `phases` over every image, stopping at the first error
    pub async fn run_phases(&mut self, phases: Vec<Box<dyn Phase>>) -> ConveyorResult<()> {
        for mut phase in phases {
            debug!("Phase {}", phase.name());
            phase.before_images(&mut self.ctx).await?;
            for image in self.images.iter_mut() {
                phase.run_image(&mut self.ctx, image).await?;
            }
            phase.after_images(&mut self.ctx).await?;
        }
        Ok(())
    }

    fn record_report(&mut self) {
        for image in &self.images {
            let entry = self.ctx.report.image_mut(image.log_name());
            entry.stages = image
                .stages
                .iter()
                .filter_map(|stage| {
                    Some(super::report::StageRecord {
                        name: stage.name().to_string(),
                        signature: stage.signature.as_ref()?.to_string(),
                        reference: stage
                            .artifact
                            .as_ref()
                            .map(|a| a.name.clone())
                            .unwrap_or_default(),
                        rebuilt: stage.rebuilt,
                    })
                })
                .collect();
            entry.rebuilt = image.stages.iter().any(|s| s.rebuilt);
            entry.content_signature = image
                .content_signature()
                .map(Signature::to_string)
                .unwrap_or_default();
            entry.final_stage = image
                .final_artifact()
                .map(|a| a.name.clone())
                .unwrap_or_default();
        }
    }

    pub fn report(&self) -> &BuildReport {
        &self.ctx.report
    }
}
