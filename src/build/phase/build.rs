//! Build phase: build and publish every stage without an artifact

use super::{stage_error, Phase};
use crate::build::conveyor::BuildContext;
use crate::build::image::Image;
use crate::error::{ConveyorError, ConveyorResult};
use crate::signature::Signature;
use crate::stage::{BaseImage, Stage, StageSpec};
use crate::storage::{format_bytes, ImageInfo};
use async_trait::async_trait;
use tracing::{debug, info};

/// Builds missing stages in chain order.
///
/// Check, build and publish of one signature happen under its stage lock,
/// so concurrent runs build each signature at most once.
pub struct BuildPhase;

#[async_trait]
impl Phase for BuildPhase {
    fn name(&self) -> &'static str {
        "build"
    }

    async fn run_image(&mut self, ctx: &mut BuildContext, image: &mut Image) -> ConveyorResult<()> {
        let log_name = image.log_name().to_string();
        let base_image = image.base_image.clone();

        for index in 0..image.stages.len() {
            let (before, rest) = image.stages.split_at_mut(index);
            let stage = &mut rest[0];
            if stage.artifact.is_some() {
                continue;
            }
            let Some(signature) = stage.signature.clone() else {
                let e = ConveyorError::Internal("stage reached build unsigned".to_string());
                return Err(stage_error(ctx, &log_name, stage, e));
            };
            if let Some(artifact) = ctx.artifacts.get(&signature) {
                debug!("{}/{} built earlier in this run", log_name, stage.name());
                stage.artifact = Some(artifact.clone());
                continue;
            }

            match build_stage(ctx, base_image.as_deref(), before.last(), stage, &signature).await {
                Ok((artifact, rebuilt)) => {
                    if rebuilt {
                        info!(
                            "{}/{} {} [built, {}]",
                            log_name,
                            stage.name(),
                            signature.short(),
                            format_bytes(artifact.size)
                        );
                    } else {
                        info!("{}/{} {} [reused]", log_name, stage.name(), signature.short());
                    }
                    ctx.artifacts.insert(signature, artifact.clone());
                    stage.artifact = Some(artifact);
                    stage.rebuilt = rebuilt;
                }
                Err(e) => return Err(stage_error(ctx, &log_name, stage, e)),
            }
        }
        Ok(())
    }
}

async fn build_stage(
    ctx: &BuildContext,
    base_image: Option<&str>,
    predecessor: Option<&Stage>,
    stage: &Stage,
    signature: &Signature,
) -> ConveyorResult<(ImageInfo, bool)> {
    let previous = match predecessor {
        Some(predecessor) => {
            let artifact = predecessor.artifact.as_ref().ok_or_else(|| {
                ConveyorError::Internal(format!("stage {} is not built", predecessor.name()))
            })?;
            Some(ctx.fetch(artifact).await?)
        }
        None => match base_image {
            Some(name) => Some(ctx.fetch_image(name).await?),
            None => None,
        },
    };
    let base_reference = match (&previous, &stage.spec) {
        (Some(previous), _) => previous.name.clone(),
        (
            None,
            StageSpec::From {
                base: BaseImage::Reference(reference),
                ..
            },
        ) => reference.clone(),
        (None, _) => {
            return Err(ConveyorError::Internal(format!(
                "stage {} has no base",
                stage.name()
            )))
        }
    };

    let locks = ctx.services.locks.clone();
    let lock = locks.lock_stage(signature).await?;
    let result = locked_build(ctx, base_image, previous.as_ref(), &base_reference, stage, signature).await;
    let unlocked = locks.unlock(lock).await;
    let built = result?;
    unlocked?;
    Ok(built)
}

/// Re-check storage, then build and publish. Runs under the stage lock.
///
/// Stored artifacts that do not fit this chain stay in storage; other
/// branches may still select them.
async fn locked_build(
    ctx: &BuildContext,
    base_image: Option<&str>,
    previous: Option<&ImageInfo>,
    base_reference: &str,
    stage: &Stage,
    signature: &Signature,
) -> ConveyorResult<(ImageInfo, bool)> {
    let storage = ctx.services.storage.as_ref();
    let project = ctx.options.project.as_str();
    let env = ctx.stage_env(base_image, previous, previous.and_then(|p| p.git_commit()));

    let fresh = storage.enumerate_by_signature(project, signature).await?;
    if let Some(existing) = stage.select_cache_artifact(&env, &fresh).await? {
        debug!("{} was published concurrently", existing.name);
        ctx.services
            .cache
            .store(project, signature, fresh, &ctx.services.locks)
            .await?;
        return Ok((existing, false));
    }
    if !fresh.is_empty() {
        debug!(
            "None of {} stored {} artifacts fits, building another",
            fresh.len(),
            stage.name()
        );
    }

    let handle = stage.build(&env, base_reference, ctx.options.introspect).await?;
    let published = storage.publish(&handle).await?;
    let mut records = fresh;
    if !records.iter().any(|r| r.name == published.name) {
        records.push(published.clone());
    }
    ctx.services
        .cache
        .store(project, signature, records, &ctx.services.locks)
        .await?;
    Ok((published, true))
}
