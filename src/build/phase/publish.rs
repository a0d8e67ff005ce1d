//! Publish phases: give final images external names

use super::{stage_error, Phase};
use crate::build::conveyor::BuildContext;
use crate::build::image::Image;
use crate::build::tagging::{resolve_tags, TagStrategy};
use crate::engine::BuildRequest;
use crate::error::{ConveyorError, ConveyorResult};
use crate::signature::Signature;
use crate::storage::{labels, normalize_id, ImageInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Placeholder in export templates replaced by the image name
const IMAGE_PLACEHOLDER: &str = "%image%";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Local tags only
    Tag,
    /// Push tagged by content signature
    Push,
    /// Push under every configured tag
    Publish,
    /// Push as-is to arbitrary references
    Export,
}

pub struct PublishPhase {
    mode: PublishMode,
}

impl PublishPhase {
    pub fn new(mode: PublishMode) -> Self {
        Self { mode }
    }

    async fn targets(
        &self,
        ctx: &BuildContext,
        image: &Image,
        signature: &Signature,
    ) -> ConveyorResult<Vec<(Option<TagStrategy>, String)>> {
        if self.mode == PublishMode::Export {
            if ctx.options.export_templates.is_empty() {
                return Err(ConveyorError::User("no export references given".to_string()));
            }
            return ctx
                .options
                .export_templates
                .iter()
                .map(|template| export_reference(template, image.name.as_deref()).map(|r| (None, r)))
                .collect();
        }

        let repository = repository(ctx, image)?;
        if self.mode == PublishMode::Push {
            return Ok(vec![(
                Some(TagStrategy::StagesSignature),
                format!("{}:{}", repository, signature),
            )]);
        }
        let tags = resolve_tags(&ctx.options.tagging, ctx.services.git.as_deref(), signature).await?;
        if tags.is_empty() {
            return Err(ConveyorError::User(
                "no tags configured, set [tagging] or pass --tag".to_string(),
            ));
        }
        Ok(tags
            .into_iter()
            .map(|tag| (Some(tag.strategy), format!("{}:{}", repository, tag.value)))
            .collect())
    }

    async fn publish_one(
        &self,
        ctx: &BuildContext,
        image: &Image,
        local: &ImageInfo,
        signature: &Signature,
        strategy: Option<TagStrategy>,
        target: &str,
    ) -> ConveyorResult<()> {
        let engine = ctx.services.engine.as_ref();
        match self.mode {
            PublishMode::Tag => {
                if let Some(existing) = engine.inspect(target).await? {
                    if normalize_id(&existing.id) == normalize_id(&local.id) {
                        debug!("{} already points at {}", target, local.name);
                        return Ok(());
                    }
                }
                engine.tag(&local.name, target).await?;
                info!("Tagged {}", target);
                Ok(())
            }
            PublishMode::Export => {
                engine.tag(&local.name, target).await?;
                engine.push(target).await?;
                info!("Exported {}", target);
                Ok(())
            }
            PublishMode::Push | PublishMode::Publish => {
                let registry = ctx.services.images_registry.as_ref().ok_or_else(|| {
                    ConveyorError::User("images repository registry is not configured".to_string())
                })?;
                if let Some(existing) = registry.get_artifact_info(target).await? {
                    if existing.label(labels::CONTENT_SIGNATURE) == Some(signature.as_str()) {
                        info!("{} is up to date", target);
                        return Ok(());
                    }
                }

                let temp_tag = format!(
                    "conveyor-publish-{}-{}",
                    signature.short(),
                    &uuid::Uuid::new_v4().simple().to_string()[..8]
                );
                let mut request = BuildRequest::new(local.name.clone(), temp_tag.clone());
                request.labels = HashMap::from([
                    (labels::IMAGE.to_string(), "true".to_string()),
                    (labels::IMAGE_NAME.to_string(), image.log_name().to_string()),
                    (labels::CONTENT_SIGNATURE.to_string(), signature.to_string()),
                ]);
                if let Some(strategy) = strategy {
                    request
                        .labels
                        .insert(labels::TAG_STRATEGY.to_string(), strategy.to_string());
                }
                let id = engine.build(&request).await?;
                engine.tag(&id, target).await?;
                let pushed = registry.push(engine, target).await;
                if let Err(e) = engine.remove(&temp_tag).await {
                    warn!("Failed to remove {}: {}", temp_tag, e);
                }
                pushed?;
                info!("Pushed {}", target);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Phase for PublishPhase {
    fn name(&self) -> &'static str {
        match self.mode {
            PublishMode::Tag => "tag",
            PublishMode::Push => "push",
            PublishMode::Publish => "publish",
            PublishMode::Export => "export",
        }
    }

    async fn run_image(&mut self, ctx: &mut BuildContext, image: &mut Image) -> ConveyorResult<()> {
        let log_name = image.log_name().to_string();
        let (Some(signature), Some(artifact), Some(final_stage)) = (
            image.content_signature().cloned(),
            image.final_artifact().cloned(),
            image.stages.last(),
        ) else {
            return Err(ConveyorError::StagesNotBuilt {
                stages: vec![log_name],
            });
        };
        let local = ctx
            .fetch(&artifact)
            .await
            .map_err(|e| stage_error(ctx, &log_name, final_stage, e))?;

        for (strategy, target) in self.targets(ctx, image, &signature).await? {
            let locks = ctx.services.locks.clone();
            let lock = locks
                .lock_image(&target)
                .await
                .map_err(|e| stage_error(ctx, &log_name, final_stage, e))?;
            let result = self
                .publish_one(ctx, image, &local, &signature, strategy, &target)
                .await;
            let unlocked = locks.unlock(lock).await;
            result
                .and(unlocked)
                .map_err(|e| stage_error(ctx, &log_name, final_stage, e))?;
            ctx.report.add_tag(&log_name, &target);
        }
        Ok(())
    }
}

/// Final images repository of `image`: `<repo>/<name>`, or `<repo>` for
/// the nameless image
fn repository(ctx: &BuildContext, image: &Image) -> ConveyorResult<String> {
    let repo = ctx.options.images_repo.as_deref().ok_or_else(|| {
        ConveyorError::User("images repository is not configured, set images_repo.address or pass --repo".to_string())
    })?;
    let repo = repo.trim_end_matches('/');
    Ok(match &image.name {
        Some(name) => format!("{}/{}", repo, name),
        None => repo.to_string(),
    })
}

fn export_reference(template: &str, name: Option<&str>) -> ConveyorResult<String> {
    if !template.contains(IMAGE_PLACEHOLDER) {
        return Ok(template.to_string());
    }
    match name {
        Some(name) => Ok(template.replace(IMAGE_PLACEHOLDER, name)),
        None => Err(ConveyorError::User(format!(
            "{} in {} needs a named image",
            IMAGE_PLACEHOLDER, template
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::conveyor::ConveyorOptions;
    use crate::build::phase::{BuildPhase, SignaturesPhase};
    use crate::config::ImageDeclaration;
    use crate::engine::ContainerEngine;
    use crate::fakes::{local_services, FakeEngine};
    use std::sync::Arc;

    #[test]
    fn export_templates() {
        assert_eq!(
            export_reference("r.io/%image%:v1", Some("api")).unwrap(),
            "r.io/api:v1"
        );
        assert_eq!(export_reference("r.io/app:v1", None).unwrap(), "r.io/app:v1");
        assert!(export_reference("r.io/%image%:v1", None).is_err());
    }

    #[tokio::test]
    async fn tag_mode_tags_locally_once() {
        let engine = Arc::new(FakeEngine::new());
        let mut options = ConveyorOptions::new("demo");
        options.images_repo = Some("registry.local/demo/".to_string());
        options.tagging.custom = vec!["v1".to_string()];
        let mut ctx = BuildContext::new(local_services(engine.clone(), "demo"), options);

        let decl = ImageDeclaration {
            name: Some("api".to_string()),
            from: Some("alpine".to_string()),
            ..Default::default()
        };
        let mut image = Image::from_declaration(&decl).unwrap();
        SignaturesPhase.run_image(&mut ctx, &mut image).await.unwrap();
        BuildPhase.run_image(&mut ctx, &mut image).await.unwrap();

        let mut phase = PublishPhase::new(PublishMode::Tag);
        phase.run_image(&mut ctx, &mut image).await.unwrap();
        phase.run_image(&mut ctx, &mut image).await.unwrap();

        let tagged = engine.inspect("registry.local/demo/api:v1").await.unwrap().unwrap();
        assert_eq!(tagged.id, image.final_artifact().unwrap().id);
        assert_eq!(ctx.report.images["api"].tags, vec!["registry.local/demo/api:v1"]);
    }

    #[tokio::test]
    async fn push_needs_a_repository() {
        let engine = Arc::new(FakeEngine::new());
        let mut ctx = BuildContext::new(local_services(engine, "demo"), ConveyorOptions::new("demo"));
        let decl = ImageDeclaration {
            name: Some("api".to_string()),
            from: Some("alpine".to_string()),
            ..Default::default()
        };
        let mut image = Image::from_declaration(&decl).unwrap();
        SignaturesPhase.run_image(&mut ctx, &mut image).await.unwrap();
        BuildPhase.run_image(&mut ctx, &mut image).await.unwrap();

        let err = PublishPhase::new(PublishMode::Push)
            .run_image(&mut ctx, &mut image)
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::User(_)));
    }

    #[tokio::test]
    async fn push_failures_name_the_image() {
        let engine = Arc::new(FakeEngine::new());
        let mut options = ConveyorOptions::new("demo");
        options.export_templates = vec!["registry.local/%image%:v1".to_string()];
        let mut ctx = BuildContext::new(local_services(engine, "demo"), options);
        let decl = ImageDeclaration {
            name: Some("api".to_string()),
            from: Some("alpine".to_string()),
            ..Default::default()
        };
        let mut image = Image::from_declaration(&decl).unwrap();
        SignaturesPhase.run_image(&mut ctx, &mut image).await.unwrap();
        BuildPhase.run_image(&mut ctx, &mut image).await.unwrap();

        let err = PublishPhase::new(PublishMode::Export)
            .run_image(&mut ctx, &mut image)
            .await
            .unwrap_err();
        match err {
            ConveyorError::Stage {
                project,
                image,
                stage,
                source,
                ..
            } => {
                assert_eq!((project.as_str(), image.as_str()), ("demo", "api"));
                assert_eq!(stage, "from");
                assert!(matches!(*source, ConveyorError::ImagePush { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
