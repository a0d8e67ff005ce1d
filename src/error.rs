//! Error types for Conveyor
//!
//! All modules use `ConveyorResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Conveyor operations
pub type ConveyorResult<T> = Result<T, ConveyorError>;

/// All errors that can occur in Conveyor
#[derive(Error, Debug)]
pub enum ConveyorError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Invalid image declaration {image}: {reason}")]
    InvalidImageDeclaration { image: String, reason: String },

    #[error("Image not found in configuration: {0}")]
    ImageNotFound(String),

    // Engine errors
    #[error("Container engine not found: {0}")]
    EngineNotFound(String),

    #[error("Image build failed: {image}\n{output}")]
    ImageBuild { image: String, output: String },

    #[error("Image pull failed: {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Image push failed: {image}: {reason}")]
    ImagePush { image: String, reason: String },

    #[error("Image not found: {0}")]
    ImageMissing(String),

    // Git errors
    #[error("Git command failed: {command}: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Stage {0} requires a git repository, but none was found")]
    GitRepoMissing(String),

    // Registry errors
    #[error("Registry request failed: {url}: {reason}")]
    Registry { url: String, reason: String },

    #[error("Registry {registry} does not support {operation}")]
    RegistryUnsupported { registry: String, operation: String },

    // Stages storage errors
    #[error("Stage {name} is not available in stages storage {storage}")]
    StageMissing { name: String, storage: String },

    #[error("Stages storage cache is stale and must be reset: {reason}")]
    ShouldResetCache { reason: String },

    // Lock errors
    #[error("Failed to acquire lock {key}: {reason}")]
    LockAcquire { key: String, reason: String },

    #[error("Failed to release lock {key}: {reason}")]
    LockRelease { key: String, reason: String },

    // Build errors
    #[error("Stages are not built: {}", .stages.join(", "))]
    StagesNotBuilt { stages: Vec<String> },

    #[error(
        "project {project}, image {image}, stage {stage} (signature {}): {source}",
        .signature.as_deref().unwrap_or("none")
    )]
    Stage {
        project: String,
        image: String,
        stage: String,
        signature: Option<String>,
        #[source]
        source: Box<ConveyorError>,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl ConveyorError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create the cache-reset sentinel
    pub fn should_reset_cache(reason: impl Into<String>) -> Self {
        Self::ShouldResetCache {
            reason: reason.into(),
        }
    }

    /// Attach project/image/stage context.
    ///
    /// Errors that already carry stage context are returned unchanged so the
    /// innermost (most precise) location wins.
    pub fn with_stage_context(
        self,
        project: &str,
        image: &str,
        stage: &str,
        signature: Option<&str>,
    ) -> Self {
        if matches!(self, Self::Stage { .. }) {
            return self;
        }
        Self::Stage {
            project: project.to_string(),
            image: image.to_string(),
            stage: stage.to_string(),
            signature: signature.map(str::to_string),
            source: Box::new(self),
        }
    }

    /// True when the run must be restarted with an empty stages storage cache.
    ///
    /// Identified by kind, looking through stage context wrappers.
    pub fn is_cache_reset(&self) -> bool {
        match self {
            Self::ShouldResetCache { .. } => true,
            Self::Stage { source, .. } => source.is_cache_reset(),
            _ => false,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Stage { source, .. } => source.is_retryable(),
            other => matches!(
                other,
                Self::ShouldResetCache { .. }
                    | Self::ImagePull { .. }
                    | Self::ImagePush { .. }
                    | Self::Registry { .. }
            ),
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Stage { source, .. } => source.hint(),
            Self::ConfigNotFound(_) => {
                Some("Create conveyor.toml in the project root or pass --config")
            }
            Self::EngineNotFound(_) => Some("Install podman or docker, or set build.engine"),
            Self::GitRepoMissing(_) => Some("Run conveyor from inside a git working tree"),
            Self::StagesNotBuilt { .. } => Some("Run: conveyor build"),
            Self::ImagePush { .. } => Some("Check registry credentials: podman login <registry>"),
            Self::LockAcquire { .. } => Some("Check the lock directory, or that locks.server is reachable"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ConveyorError::StagesNotBuilt {
            stages: vec!["app/install".to_string(), "app/setup".to_string()],
        };
        assert_eq!(err.to_string(), "Stages are not built: app/install, app/setup");
    }

    #[test]
    fn error_hint() {
        let err = ConveyorError::EngineNotFound("podman".to_string());
        assert_eq!(
            err.hint(),
            Some("Install podman or docker, or set build.engine")
        );
    }

    #[test]
    fn cache_reset_detected_through_stage_context() {
        let err = ConveyorError::should_reset_cache("stage vanished").with_stage_context(
            "demo",
            "app",
            "install",
            Some("abc"),
        );
        assert!(err.is_cache_reset());
        assert!(err.to_string().contains("stage install"));
        assert!(err.to_string().contains("signature abc"));
    }

    #[test]
    fn stage_context_is_not_nested() {
        let err = ConveyorError::Internal("boom".to_string())
            .with_stage_context("demo", "app", "setup", None)
            .with_stage_context("demo", "other", "from", None);
        match err {
            ConveyorError::Stage { image, stage, .. } => {
                assert_eq!(image, "app");
                assert_eq!(stage, "setup");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn error_retryable() {
        assert!(ConveyorError::should_reset_cache("x").is_retryable());
        assert!(!ConveyorError::ImageNotFound("app".to_string()).is_retryable());
        assert!(!ConveyorError::User("message mentioning cache reset".to_string()).is_cache_reset());
    }
}
