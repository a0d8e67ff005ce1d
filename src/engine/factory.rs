//! Engine factory for creating the configured container engine
//!
//! Provides automatic engine detection and instantiation.

use crate::config::Config;
use crate::engine::cli::{CliEngine, EngineKind};
use crate::engine::runtime::ContainerEngine;
use crate::error::{ConveyorError, ConveyorResult};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Create the container engine named by `build.engine`.
///
/// `auto` prefers podman and falls back to docker.
pub async fn create_engine(
    config: &Config,
    builds_dir: &Path,
) -> ConveyorResult<Arc<dyn ContainerEngine>> {
    let kind = match config.build.engine.as_str() {
        "podman" => EngineKind::Podman,
        "docker" => EngineKind::Docker,
        "auto" => detect().await?,
        other => {
            return Err(ConveyorError::ConfigInvalid {
                path: "build.engine".into(),
                reason: format!("unknown engine '{}', expected auto, podman or docker", other),
            })
        }
    };
    debug!("Using {} engine", kind.binary());

    let engine = CliEngine::new(kind, builds_dir);
    engine.ensure_ready().await?;
    Ok(Arc::new(engine))
}

async fn detect() -> ConveyorResult<EngineKind> {
    for kind in [EngineKind::Podman, EngineKind::Docker] {
        if kind.installed().await {
            return Ok(kind);
        }
    }
    Err(ConveyorError::EngineNotFound("podman or docker".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_engine_is_rejected() {
        let mut config = Config::default();
        config.build.engine = "containerd".to_string();
        let result = create_engine(&config, Path::new("/tmp")).await;
        match result {
            Err(ConveyorError::ConfigInvalid { reason, .. }) => {
                assert!(reason.contains("containerd"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected error"),
        }
    }
}
