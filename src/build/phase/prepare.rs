//! Prepare phase: assemble build inputs for stages that will be built

use super::Phase;
use crate::build::conveyor::BuildContext;
use crate::build::image::Image;
use crate::error::ConveyorResult;
use crate::stage::{BuildInputs, StageSpec, SERVICE_DIR};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

/// Gives every unbound stage its service labels and, for instruction
/// stages, the host ssh agent.
pub struct PreparePhase;

#[async_trait]
impl Phase for PreparePhase {
    fn name(&self) -> &'static str {
        "prepare"
    }

    async fn run_image(&mut self, ctx: &mut BuildContext, image: &mut Image) -> ConveyorResult<()> {
        let log_name = image.log_name().to_string();
        for stage in image.stages.iter_mut() {
            if stage.artifact.is_some() {
                continue;
            }
            let Some(signature) = &stage.signature else {
                continue;
            };
            if ctx.artifacts.contains_key(signature) {
                continue;
            }

            let mut inputs = BuildInputs {
                labels: stage.service_labels(&ctx.options.project, &ctx.options.cache_version),
                ..Default::default()
            };
            if let (Some(sock), StageSpec::Instructions { .. }) =
                (&ctx.options.ssh_auth_sock, &stage.spec)
            {
                let target = format!("{}/ssh-agent.sock", SERVICE_DIR);
                inputs
                    .volumes
                    .push(format!("{}:{}", sock.display(), target));
                inputs.run_env = HashMap::from([("SSH_AUTH_SOCK".to_string(), target)]);
            }
            debug!("{}/{} prepared", log_name, stage.name());
            stage.inputs = Some(inputs);
        }
        Ok(())
    }
}
