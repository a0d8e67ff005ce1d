//! Configuration schema for Conveyor
//!
//! Configuration is read from `conveyor.toml` in the project root.

use crate::build::TaggingOptions;
use crate::error::{ConveyorError, ConveyorResult};
use crate::stage::{DockerInstructions, GitMapping, LifecycleSlot};
use crate::storage::LOCAL_STORAGE_ADDRESS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project: ProjectConfig,

    /// Where stage artifacts are stored
    pub storage: StorageConfig,

    /// Where final images are published
    pub images_repo: ImagesRepoConfig,

    pub locks: LocksConfig,

    pub build: BuildConfig,

    pub tagging: TaggingOptions,

    pub export: ExportConfig,

    pub report: ReportConfig,

    /// Image declarations, `[[image]]` tables
    #[serde(rename = "image")]
    pub images: Vec<ImageDeclaration>,
}

impl Config {
    /// Reject configurations the pipeline cannot run
    pub fn validate(&self, path: &Path) -> ConveyorResult<()> {
        let invalid = |reason: String| ConveyorError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        };

        let name = &self.project.name;
        if name.is_empty() {
            return Err(invalid("project.name is required".to_string()));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(invalid(format!(
                "project.name '{}' may only contain lowercase letters, digits, '-' and '_'",
                name
            )));
        }
        if self.images.is_empty() {
            return Err(invalid("no [[image]] declared".to_string()));
        }
        if self.storage.address.is_empty() {
            return Err(invalid("storage.address must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Project identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project name, part of every stage artifact name
    pub name: String,
}

/// Stages storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `:local` or a registry repository
    pub address: String,

    /// Sub-repository appended to a registry address
    pub image: Option<String>,

    /// Talk plain HTTP to the registry
    pub insecure: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            address: LOCAL_STORAGE_ADDRESS.to_string(),
            image: None,
            insecure: false,
        }
    }
}

impl StorageConfig {
    pub fn is_local(&self) -> bool {
        self.address == LOCAL_STORAGE_ADDRESS
    }
}

/// Final images repository
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesRepoConfig {
    pub address: Option<String>,
    pub insecure: bool,
}

/// Lock settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    /// Lock file directory; shared by every runner on the host
    pub dir: Option<PathBuf>,

    /// Lock server shared by runners on several hosts (`host:port` or URL).
    /// Takes precedence over `dir`.
    pub server: Option<String>,
}

/// Build settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Engine binary: auto, podman or docker
    pub engine: String,

    /// Open a shell in the base image when a stage fails
    pub introspect_before_error: bool,

    /// Open a shell with the failed commands replayed
    pub introspect_after_error: bool,

    /// Forward SSH_AUTH_SOCK into instruction stages
    pub ssh_agent: bool,

    /// Re-validate reused artifacts before building
    pub renew: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            engine: "auto".to_string(),
            introspect_before_error: false,
            introspect_after_error: false,
            ssh_agent: true,
            renew: false,
        }
    }
}

/// Export settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Target templates; `%image%` expands to the image name
    pub templates: Vec<String>,
}

/// Build report settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub path: Option<PathBuf>,
}

/// Commands (or dependency paths) per lifecycle slot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotLists {
    pub before_install: Vec<String>,
    pub install: Vec<String>,
    pub before_setup: Vec<String>,
    pub setup: Vec<String>,
}

impl SlotLists {
    pub fn get(&self, slot: LifecycleSlot) -> &[String] {
        match slot {
            LifecycleSlot::BeforeInstall => &self.before_install,
            LifecycleSlot::Install => &self.install,
            LifecycleSlot::BeforeSetup => &self.before_setup,
            LifecycleSlot::Setup => &self.setup,
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// One `[[image]]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageDeclaration {
    /// Image name; omitted for the single nameless image
    pub name: Option<String>,

    /// Base image reference
    pub from: Option<String>,

    /// Base on another declared image instead
    pub from_image: Option<String>,

    /// Resolve `from` to its current registry digest on every run
    pub from_latest: bool,

    /// Bumping it rebuilds the image from scratch
    pub from_cache_version: Option<String>,

    pub git: Vec<GitMapping>,

    pub shell: SlotLists,

    pub ansible: SlotLists,

    /// Repository paths whose changes rebuild a slot
    pub dependencies: SlotLists,

    pub docker: DockerInstructions,
}
