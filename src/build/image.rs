//! Images: declared build targets and their stage chains

use crate::config::ImageDeclaration;
use crate::error::{ConveyorError, ConveyorResult};
use crate::signature::Signature;
use crate::stage::{BaseImage, InstructionKind, LifecycleSlot, Stage, StageSpec};
use crate::storage::ImageInfo;
use std::collections::HashSet;

/// Log name of the nameless image
pub const NAMELESS: &str = "~";

/// A build target: an ordered stage chain on a base image
#[derive(Debug, Clone)]
pub struct Image {
    pub name: Option<String>,
    pub stages: Vec<Stage>,
    /// Declared image this one is built on, if any
    pub base_image: Option<String>,
    /// Commit the image's git content comes from, once signed
    pub content_commit: Option<String>,
}

impl Image {
    /// Expand a declaration into the full stage chain.
    ///
    /// Every stage kind is present; the signatures phase prunes the empty ones.
    pub fn from_declaration(decl: &ImageDeclaration) -> ConveyorResult<Self> {
        let log_name = decl.name.clone().unwrap_or_else(|| NAMELESS.to_string());
        let invalid = |reason: &str| ConveyorError::InvalidImageDeclaration {
            image: log_name.clone(),
            reason: reason.to_string(),
        };

        let base = match (&decl.from, &decl.from_image) {
            (Some(_), Some(_)) => return Err(invalid("set either from or from_image, not both")),
            (None, None) => return Err(invalid("from or from_image is required")),
            (Some(reference), None) if reference.trim().is_empty() => {
                return Err(invalid("from must not be empty"))
            }
            (Some(reference), None) => BaseImage::Reference(reference.trim().to_string()),
            (None, Some(name)) => BaseImage::Image(name.clone()),
        };
        if matches!(base, BaseImage::Image(_)) && decl.from_latest {
            return Err(invalid("from_latest only applies to from"));
        }
        if !decl.shell.is_empty() && !decl.ansible.is_empty() {
            return Err(invalid("use either shell or ansible instructions, not both"));
        }
        if decl.name.as_deref() == Some("") {
            return Err(invalid("name must not be empty"));
        }

        let (kind, commands) = if decl.ansible.is_empty() {
            (InstructionKind::Shell, &decl.shell)
        } else {
            (InstructionKind::Ansible, &decl.ansible)
        };
        let instructions = |slot: LifecycleSlot| {
            Stage::new(StageSpec::Instructions {
                slot,
                kind,
                commands: commands.get(slot).to_vec(),
                dependencies: decl.dependencies.get(slot).to_vec(),
            })
        };

        let base_image = match &base {
            BaseImage::Image(name) => Some(name.clone()),
            BaseImage::Reference(_) => None,
        };
        let stages = vec![
            Stage::new(StageSpec::From {
                base,
                from_latest: decl.from_latest,
                cache_version: decl.from_cache_version.clone(),
            }),
            instructions(LifecycleSlot::BeforeInstall),
            Stage::new(StageSpec::GitArchive(decl.git.clone())),
            instructions(LifecycleSlot::Install),
            instructions(LifecycleSlot::BeforeSetup),
            instructions(LifecycleSlot::Setup),
            Stage::new(StageSpec::GitLatestPatch(decl.git.clone())),
            Stage::new(StageSpec::DockerInstructions(decl.docker.clone())),
        ];

        Ok(Self {
            name: decl.name.clone(),
            stages,
            base_image,
            content_commit: None,
        })
    }

    /// Name for logs and reports (`~` for the nameless image)
    pub fn log_name(&self) -> &str {
        self.name.as_deref().unwrap_or(NAMELESS)
    }

    /// Signature of the last stage, once signed
    pub fn content_signature(&self) -> Option<&Signature> {
        self.stages.last().and_then(|s| s.signature.as_ref())
    }

    /// Artifact of the last stage, once bound
    pub fn final_artifact(&self) -> Option<&ImageInfo> {
        self.stages.last().and_then(|s| s.artifact.as_ref())
    }
}

/// Order images so each runs after the image it is based on.
///
/// Declared order is kept wherever dependencies allow.
pub fn order_images(images: Vec<Image>) -> ConveyorResult<Vec<Image>> {
    let mut seen = HashSet::new();
    let nameless = images.iter().filter(|i| i.name.is_none()).count();
    if nameless > 1 || (nameless == 1 && images.len() > 1) {
        return Err(ConveyorError::InvalidImageDeclaration {
            image: NAMELESS.to_string(),
            reason: "a nameless image must be the only image".to_string(),
        });
    }
    for image in &images {
        if !seen.insert(image.log_name().to_string()) {
            return Err(ConveyorError::InvalidImageDeclaration {
                image: image.log_name().to_string(),
                reason: "declared more than once".to_string(),
            });
        }
    }
    for image in &images {
        if let Some(base) = &image.base_image {
            if !seen.contains(base) {
                return Err(ConveyorError::InvalidImageDeclaration {
                    image: image.log_name().to_string(),
                    reason: format!("from_image refers to unknown image {}", base),
                });
            }
        }
    }

    let mut pending = images;
    let mut ordered: Vec<Image> = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let ready = pending.iter().position(|image| match &image.base_image {
            None => true,
            Some(base) => ordered.iter().any(|done| done.log_name() == base),
        });
        match ready {
            Some(index) => ordered.push(pending.remove(index)),
            None => {
                let names: Vec<&str> = pending.iter().map(|i| i.log_name()).collect();
                return Err(ConveyorError::InvalidImageDeclaration {
                    image: names.join(", "),
                    reason: "from_image dependency cycle".to_string(),
                });
            }
        }
    }
    Ok(ordered)
}

/// Keep only `names` and the images they are based on
pub fn select_images(images: Vec<Image>, names: &[String]) -> ConveyorResult<Vec<Image>> {
    if names.is_empty() {
        return Ok(images);
    }
    for name in names {
        if !images.iter().any(|i| i.log_name() == name) {
            return Err(ConveyorError::ImageNotFound(name.clone()));
        }
    }

    let mut wanted: HashSet<String> = names.iter().cloned().collect();
    // Images are ordered, so walking backwards reaches dependents first.
    for image in images.iter().rev() {
        if wanted.contains(image.log_name()) {
            if let Some(base) = &image.base_image {
                wanted.insert(base.clone());
            }
        }
    }
    Ok(images
        .into_iter()
        .filter(|i| wanted.contains(i.log_name()))
        .collect())
}
