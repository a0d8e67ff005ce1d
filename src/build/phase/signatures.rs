//! Signatures phase: sign every stage and bind cached artifacts

use super::{stage_error, Phase};
use crate::build::conveyor::BuildContext;
use crate::build::image::Image;
use crate::error::{ConveyorError, ConveyorResult};
use crate::signature::sign;
use crate::stage::{Stage, StageSpec};
use crate::storage::ImageInfo;
use async_trait::async_trait;
use tracing::{debug, info};

/// Assigns signatures in chain order, prunes empty stages and binds each
/// signature to a stored artifact when a usable one exists.
///
/// Signatures already assigned are kept, so running the phase again is a
/// no-op for an unchanged image.
pub struct SignaturesPhase;

#[async_trait]
impl Phase for SignaturesPhase {
    fn name(&self) -> &'static str {
        "signatures"
    }

    async fn run_image(&mut self, ctx: &mut BuildContext, image: &mut Image) -> ConveyorResult<()> {
        let log_name = image.log_name().to_string();
        let base_image = image.base_image.clone();
        let stages = std::mem::take(&mut image.stages);
        let mut kept: Vec<Stage> = Vec::with_capacity(stages.len());
        let mut content_commit: Option<String> = None;

        for mut stage in stages {
            let previous = match kept.last() {
                Some(stage) => stage.artifact.clone(),
                None => ctx.image_artifact(base_image.as_deref()).cloned(),
            };
            let chain_bound = previous.is_some() || (kept.is_empty() && base_image.is_none());

            let result = async {
                if stage.signature.is_none()
                    && !sign_stage(ctx, &base_image, kept.last(), &previous, &content_commit, &mut stage)
                        .await?
                {
                    return Ok(false);
                }
                if stage.artifact.is_none() && chain_bound {
                    bind_stage(ctx, &base_image, &previous, &content_commit, &mut stage).await?;
                }
                content_commit = track_commit(ctx, &stage, content_commit.take()).await?;
                Ok::<_, ConveyorError>(true)
            }
            .await;

            match result {
                Ok(true) => {
                    info!(
                        "{}/{} {} {}",
                        log_name,
                        stage.name(),
                        stage.signature.as_ref().map(|s| s.short()).unwrap_or(""),
                        if stage.artifact.is_some() { "[cached]" } else { "[to build]" }
                    );
                    kept.push(stage);
                }
                Ok(false) => debug!("{}/{} is empty, skipping", log_name, stage.name()),
                Err(e) => return Err(stage_error(ctx, &log_name, &stage, e)),
            }
        }

        image.stages = kept;
        image.content_commit = content_commit;
        if let Some(signature) = image.content_signature() {
            ctx.final_signatures
                .insert(log_name, signature.clone());
        }
        Ok(())
    }
}

/// Compute the stage's signature; `false` when the stage is empty
async fn sign_stage(
    ctx: &BuildContext,
    base_image: &Option<String>,
    predecessor: Option<&Stage>,
    previous: &Option<ImageInfo>,
    content_commit: &Option<String>,
    stage: &mut Stage,
) -> ConveyorResult<bool> {
    let env = ctx.stage_env(
        base_image.as_deref(),
        previous.as_ref(),
        content_commit.as_deref(),
    );
    if stage.is_empty(&env).await? {
        return Ok(false);
    }

    let digest = stage.dependency_digest(&env).await?;
    let chained = predecessor
        .and_then(|p| p.signature.as_ref())
        .map(|s| s.as_str())
        .unwrap_or("");
    let signature = sign(&digest, chained, &ctx.options.cache_version);
    debug!("{} digest {} -> {}", stage.name(), digest, signature.short());

    stage.digest = Some(digest);
    stage.signature = Some(signature);
    Ok(true)
}

/// Bind the stage to an artifact of this run or a usable stored one
async fn bind_stage(
    ctx: &mut BuildContext,
    base_image: &Option<String>,
    previous: &Option<ImageInfo>,
    content_commit: &Option<String>,
    stage: &mut Stage,
) -> ConveyorResult<()> {
    let Some(signature) = stage.signature.clone() else {
        return Ok(());
    };
    if let Some(artifact) = ctx.artifacts.get(&signature) {
        stage.artifact = Some(artifact.clone());
        return Ok(());
    }

    let (_, candidates) = ctx
        .services
        .cache
        .lookup(
            &ctx.options.project,
            &signature,
            ctx.services.storage.as_ref(),
            &ctx.services.locks,
        )
        .await?;
    let env = ctx.stage_env(
        base_image.as_deref(),
        previous.as_ref(),
        content_commit.as_deref(),
    );
    let selected = stage.select_cache_artifact(&env, &candidates).await?;

    if let Some(artifact) = selected {
        ctx.artifacts.insert(signature, artifact.clone());
        stage.artifact = Some(artifact);
    }
    Ok(())
}

/// Commit the image's git content comes from after `stage`
async fn track_commit(
    ctx: &BuildContext,
    stage: &Stage,
    current: Option<String>,
) -> ConveyorResult<Option<String>> {
    let head = || async move {
        match &ctx.services.git {
            Some(git) => git.latest_commit().await.map(Some),
            None => Ok(None),
        }
    };
    match &stage.spec {
        StageSpec::GitArchive(_) => match stage.artifact.as_ref().and_then(|a| a.git_commit()) {
            Some(commit) => Ok(Some(commit.to_string())),
            None => head().await,
        },
        StageSpec::GitLatestPatch(_) => head().await,
        _ => Ok(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageDeclaration;
    use crate::fakes::{local_services, FakeEngine};
    use crate::build::conveyor::ConveyorOptions;
    use crate::stage::StageName;
    use std::sync::Arc;

    fn context(engine: Arc<FakeEngine>) -> BuildContext {
        let mut options = ConveyorOptions::new("demo");
        options.cache_version = "7".to_string();
        BuildContext::new(local_services(engine, "demo"), options)
    }

    fn image(install: &str) -> Image {
        let mut decl = ImageDeclaration {
            name: Some("app".to_string()),
            from: Some("base:ubuntu".to_string()),
            ..Default::default()
        };
        decl.shell.install = vec![install.to_string()];
        decl.shell.setup = vec!["make".to_string()];
        Image::from_declaration(&decl).unwrap()
    }

    fn signatures(image: &Image) -> Vec<String> {
        image
            .stages
            .iter()
            .map(|s| s.signature.as_ref().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn prunes_empty_stages_and_chains_signatures() {
        let mut ctx = context(Arc::new(FakeEngine::new()));
        let mut image = image("apt install curl");
        SignaturesPhase.run_image(&mut ctx, &mut image).await.unwrap();

        let names: Vec<StageName> = image.stages.iter().map(Stage::name).collect();
        assert_eq!(names, vec![StageName::From, StageName::Install, StageName::Setup]);

        let from = sign("base:ubuntu", "", "7");
        let install = sign("apt install curl", from.as_str(), "7");
        assert_eq!(image.stages[0].signature, Some(from));
        assert_eq!(image.stages[1].signature, Some(install.clone()));
        assert_eq!(
            image.stages[2].signature,
            Some(sign("make", install.as_str(), "7"))
        );
        assert_eq!(ctx.final_signatures["app"], sign("make", install.as_str(), "7"));
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let mut ctx = context(Arc::new(FakeEngine::new()));
        let mut image = image("apt install curl");
        SignaturesPhase.run_image(&mut ctx, &mut image).await.unwrap();
        let first = signatures(&image);
        SignaturesPhase.run_image(&mut ctx, &mut image).await.unwrap();
        assert_eq!(signatures(&image), first);
        assert_eq!(image.stages.len(), 3);
    }

    #[tokio::test]
    async fn change_propagates_down_the_chain_only() {
        let mut ctx = context(Arc::new(FakeEngine::new()));
        let mut a = image("apt install curl");
        let mut b = image("apt install wget");
        SignaturesPhase.run_image(&mut ctx, &mut a).await.unwrap();
        SignaturesPhase.run_image(&mut ctx, &mut b).await.unwrap();

        let (a, b) = (signatures(&a), signatures(&b));
        assert_eq!(a[0], b[0]);
        assert_ne!(a[1], b[1]);
        assert_ne!(a[2], b[2]);
    }

    #[tokio::test]
    async fn nothing_bound_when_storage_is_empty() {
        let mut ctx = context(Arc::new(FakeEngine::new()));
        let mut image = image("apt install curl");
        SignaturesPhase.run_image(&mut ctx, &mut image).await.unwrap();
        assert!(image.stages.iter().all(|s| s.artifact.is_none()));
        assert!(ctx.artifacts.is_empty());
    }
}
