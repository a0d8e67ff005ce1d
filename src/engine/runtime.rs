//! Container engine abstraction
//!
//! Provides a trait for the image operations the build pipeline needs, so
//! the pipeline never depends on a particular engine binary.

use crate::error::ConveyorResult;
use crate::storage::ImageInfo;
use async_trait::async_trait;
use std::collections::HashMap;

/// One build step applied on top of the base image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Shell commands, run in order in a single layer
    Run(Vec<String>),
    Env(String, String),
    Expose(String),
    Volume(String),
    Workdir(String),
    User(String),
    Cmd(Vec<String>),
    Entrypoint(Vec<String>),
    /// Tar archive extracted into `to`
    AddArchive { archive: Vec<u8>, to: String },
    /// Unified diff applied inside `to`
    ApplyPatch { patch: Vec<u8>, to: String },
    /// Plain file placed at `to`
    AddFile { content: Vec<u8>, to: String },
}

/// Everything an engine needs to produce one image
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    /// Reference of the image to build on
    pub base: String,
    /// Temporary reference for the result
    pub tag: String,
    pub instructions: Vec<Instruction>,
    pub labels: HashMap<String, String>,
    /// Build-time bind mounts (`host:container`)
    pub volumes: Vec<String>,
    /// Environment exported to `Run` instructions only
    pub run_env: HashMap<String, String>,
}

impl BuildRequest {
    pub fn new(base: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// Shell commands of all `Run` instructions, in order
    pub fn run_commands(&self) -> Vec<String> {
        self.instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Run(commands) => Some(commands.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// Abstract container engine interface
///
/// Implemented by the podman/docker CLI engine and by in-memory fakes.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Ensure the engine is installed and answering
    async fn ensure_ready(&self) -> ConveyorResult<()>;

    /// Build an image and return its ID
    async fn build(&self, request: &BuildRequest) -> ConveyorResult<String>;

    /// Inspect a local image, `None` if it does not exist
    async fn inspect(&self, reference: &str) -> ConveyorResult<Option<ImageInfo>>;

    /// All local images of `repository`
    async fn list(&self, repository: &str) -> ConveyorResult<Vec<ImageInfo>>;

    /// Add `target` as a reference to the image `source` (ID or reference)
    async fn tag(&self, source: &str, target: &str) -> ConveyorResult<()>;

    /// Upload a local reference to its registry
    async fn push(&self, reference: &str) -> ConveyorResult<()>;

    /// Download a reference from its registry
    async fn pull(&self, reference: &str) -> ConveyorResult<()>;

    /// Remove a local reference. Missing references are not an error.
    async fn remove(&self, reference: &str) -> ConveyorResult<()>;

    /// Open an interactive shell in `reference`, optionally replaying
    /// `commands` first
    async fn introspect(&self, reference: &str, commands: &[String]) -> ConveyorResult<()>;

    /// Get the human-readable engine name for display
    fn engine_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_commands_flattens_in_order() {
        let mut request = BuildRequest::new("alpine", "tmp");
        request.instructions = vec![
            Instruction::Run(vec!["a".to_string(), "b".to_string()]),
            Instruction::Env("K".to_string(), "V".to_string()),
            Instruction::Run(vec!["c".to_string()]),
        ];
        assert_eq!(request.run_commands(), vec!["a", "b", "c"]);
    }
}
