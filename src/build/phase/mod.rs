//! Pipeline phases
//!
//! Each phase is one pass over every image, in order. Phases communicate
//! only through the images' stages and the [`BuildContext`].

mod build;
mod check;
mod prepare;
mod publish;
mod renew;
mod signatures;

pub use build::BuildPhase;
pub use check::CheckOnlyPhase;
pub use prepare::PreparePhase;
pub use publish::{PublishMode, PublishPhase};
pub use renew::RenewPhase;
pub use signatures::SignaturesPhase;

use super::conveyor::BuildContext;
use super::image::Image;
use crate::error::{ConveyorError, ConveyorResult};
use crate::stage::Stage;
use async_trait::async_trait;

/// One pass of the pipeline
#[async_trait]
pub trait Phase: Send {
    fn name(&self) -> &'static str;

    async fn before_images(&mut self, _ctx: &mut BuildContext) -> ConveyorResult<()> {
        Ok(())
    }

    async fn run_image(&mut self, ctx: &mut BuildContext, image: &mut Image)
        -> ConveyorResult<()>;

    async fn after_images(&mut self, _ctx: &mut BuildContext) -> ConveyorResult<()> {
        Ok(())
    }
}

/// Attach the stage's location to an error
pub(crate) fn stage_error(
    ctx: &BuildContext,
    image: &str,
    stage: &Stage,
    error: ConveyorError,
) -> ConveyorError {
    error.with_stage_context(
        &ctx.options.project,
        image,
        stage.name().as_str(),
        stage.signature.as_ref().map(|s| s.as_str()),
    )
}
