//! Check phase: fail when any stage would have to be built

use super::Phase;
use crate::build::conveyor::BuildContext;
use crate::build::image::Image;
use crate::error::{ConveyorError, ConveyorResult};
use async_trait::async_trait;
use tracing::warn;

#[derive(Default)]
pub struct CheckOnlyPhase {
    missing: Vec<String>,
}

#[async_trait]
impl Phase for CheckOnlyPhase {
    fn name(&self) -> &'static str {
        "check"
    }

    async fn run_image(&mut self, _ctx: &mut BuildContext, image: &mut Image) -> ConveyorResult<()> {
        for stage in &image.stages {
            if stage.artifact.is_none() {
                warn!("{}/{} is not built", image.log_name(), stage.name());
                self.missing
                    .push(format!("{}/{}", image.log_name(), stage.name()));
            }
        }
        Ok(())
    }

    async fn after_images(&mut self, _ctx: &mut BuildContext) -> ConveyorResult<()> {
        if self.missing.is_empty() {
            return Ok(());
        }
        Err(ConveyorError::StagesNotBuilt {
            stages: std::mem::take(&mut self.missing),
        })
    }
}
