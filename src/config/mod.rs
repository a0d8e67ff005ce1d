//! Configuration management for Conveyor

pub mod schema;

pub use schema::{Config, ImageDeclaration, SlotLists};

use crate::error::{ConveyorError, ConveyorResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// File name looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "conveyor.toml";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Config manager for `./conveyor.toml`
    pub fn new() -> Self {
        Self {
            config_path: PathBuf::from(CONFIG_FILE_NAME),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("conveyor")
    }

    /// Default lock directory, shared by all runs on the host
    pub fn locks_dir() -> PathBuf {
        Self::state_dir().join("locks")
    }

    /// Per-build context directories
    pub fn builds_dir() -> PathBuf {
        Self::state_dir().join("builds")
    }

    /// Load and validate the configuration
    pub async fn load(&self) -> ConveyorResult<Config> {
        if !self.config_path.exists() {
            return Err(ConveyorError::ConfigNotFound(self.config_path.clone()));
        }
        debug!("Loading config from {}", self.config_path.display());

        let content = fs::read_to_string(&self.config_path).await.map_err(|e| {
            ConveyorError::io(
                format!("reading config from {}", self.config_path.display()),
                e,
            )
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConveyorError::ConfigInvalid {
            path: self.config_path.clone(),
            reason: e.to_string(),
        })?;
        config.validate(&self.config_path)?;
        Ok(config)
    }

    /// Ensure all state directories exist
    pub async fn ensure_state_dirs(config: &Config) -> ConveyorResult<()> {
        let locks = config.locks.dir.clone().unwrap_or_else(Self::locks_dir);
        for dir in [Self::state_dir(), Self::builds_dir(), locks] {
            fs::create_dir_all(&dir).await.map_err(|e| {
                ConveyorError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_config_is_an_error() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(temp.path().join("conveyor.toml"));
        assert!(matches!(
            manager.load().await,
            Err(ConveyorError::ConfigNotFound(_))
        ));
    }

    #[tokio::test]
    async fn load_valid_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conveyor.toml");
        std::fs::write(
            &path,
            "[project]\nname = \"demo\"\n\n[[image]]\nfrom = \"alpine\"\n",
        )
        .unwrap();

        let config = ConfigManager::with_path(path).load().await.unwrap();
        assert_eq!(config.project.name, "demo");
        assert_eq!(config.images[0].from.as_deref(), Some("alpine"));
    }

    #[tokio::test]
    async fn invalid_toml_reports_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conveyor.toml");
        std::fs::write(&path, "[project\nname=").unwrap();

        match ConfigManager::with_path(path.clone()).load().await {
            Err(ConveyorError::ConfigInvalid { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
