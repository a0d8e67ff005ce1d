//! Renew phase: evict stale stored artifacts of bound stages

use super::{stage_error, Phase};
use crate::build::conveyor::BuildContext;
use crate::build::image::Image;
use crate::error::{ConveyorError, ConveyorResult};
use crate::storage::labels;
use async_trait::async_trait;
use tracing::{info, warn};

/// Re-validates bound artifacts against storage.
///
/// Evicting anything invalidates what earlier phases looked up, so the
/// phase ends by asking for a cache reset.
#[derive(Default)]
pub struct RenewPhase {
    evicted: usize,
}

#[async_trait]
impl Phase for RenewPhase {
    fn name(&self) -> &'static str {
        "renew"
    }

    async fn run_image(&mut self, ctx: &mut BuildContext, image: &mut Image) -> ConveyorResult<()> {
        let storage = ctx.services.storage.clone();
        for stage in &image.stages {
            let (Some(signature), Some(artifact)) = (&stage.signature, &stage.artifact) else {
                continue;
            };
            let fresh = storage
                .enumerate_by_signature(&ctx.options.project, signature)
                .await
                .map_err(|e| stage_error(ctx, image.log_name(), stage, e))?;

            for candidate in &fresh {
                if candidate.label(labels::CACHE_VERSION) == Some(ctx.options.cache_version.as_str()) {
                    continue;
                }
                match storage.delete(candidate).await {
                    Ok(()) => {
                        info!("Evicted stale stage {}", candidate.name);
                        self.evicted += 1;
                    }
                    Err(e) => warn!("Failed to evict {}: {}", candidate.name, e),
                }
            }
            if !fresh.iter().any(|c| c.name == artifact.name) {
                warn!("{} is gone from {}", artifact.name, storage.address());
                self.evicted += 1;
            }
        }
        Ok(())
    }

    async fn after_images(&mut self, _ctx: &mut BuildContext) -> ConveyorResult<()> {
        if self.evicted == 0 {
            return Ok(());
        }
        Err(ConveyorError::should_reset_cache(format!(
            "{} stale stage artifacts evicted",
            self.evicted
        )))
    }
}
