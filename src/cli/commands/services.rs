//! Collaborators shared by every command

use crate::build::ConveyorServices;
use crate::config::{Config, ConfigManager};
use crate::engine::{cleanup_stale_build_dirs, create_engine, STALE_BUILD_DIR_AGE};
use crate::error::ConveyorResult;
use crate::git::{GitRepo, LocalGitRepo};
use crate::lock::{FileLockBackend, HttpLockBackend, LockBackend, LockManager};
use crate::registry::{DockerRegistry, Registry, RegistryCredentials};
use crate::storage::{create_stages_storage, StagesStorageCache};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Host lock held while sweeping leftover build directories
const CLEANUP_LOCK: &str = "cleanup";

/// Create the engine, registries, locks, git access and stages storage
/// described by `config`. `project_dir` is searched for a git repository.
pub async fn create_services(config: &Config, project_dir: &Path) -> ConveyorResult<ConveyorServices> {
    let builds_dir = ConfigManager::builds_dir();
    let engine = create_engine(config, &builds_dir).await?;

    let storage_registry: Option<Arc<dyn Registry>> = if config.storage.is_local() {
        None
    } else {
        Some(Arc::new(DockerRegistry::new(
            &config.storage.address,
            RegistryCredentials::from_env(),
            config.storage.insecure,
        )))
    };
    let storage = create_stages_storage(
        &config.storage.address,
        config.storage.image.as_deref(),
        engine.clone(),
        storage_registry,
    )?;

    let images_registry: Option<Arc<dyn Registry>> =
        config.images_repo.address.as_deref().map(|address| {
            Arc::new(DockerRegistry::new(
                address,
                RegistryCredentials::from_env(),
                config.images_repo.insecure,
            )) as Arc<dyn Registry>
        });

    let locks = LockManager::new(lock_backend(config), &config.project.name);

    let git: Option<Arc<dyn GitRepo>> = match LocalGitRepo::discover(project_dir).await {
        Ok(repo) => repo.map(|r| Arc::new(r) as Arc<dyn GitRepo>),
        Err(e) => {
            debug!("Git unavailable: {}", e);
            None
        }
    };

    let services = ConveyorServices {
        engine,
        storage,
        cache: Arc::new(StagesStorageCache::new()),
        locks,
        git,
        images_registry,
    };
    housekeeping(&services, &builds_dir).await;
    Ok(services)
}

/// Lock server when one is configured, otherwise host-local lock files
fn lock_backend(config: &Config) -> Arc<dyn LockBackend> {
    if let Some(server) = config.locks.server.as_deref() {
        debug!("Using lock server {}", server);
        return Arc::new(HttpLockBackend::new(server));
    }
    if !config.storage.is_local() {
        warn!(
            "Stages storage {} is shared, but locks only cover this host; set locks.server for runners on several hosts",
            config.storage.address
        );
    }
    let dir = config
        .locks
        .dir
        .clone()
        .unwrap_or_else(ConfigManager::locks_dir);
    Arc::new(FileLockBackend::new(dir))
}

/// Remove build directories left by crashed runs, unless another run on
/// this host is already doing it
async fn housekeeping(services: &ConveyorServices, builds_dir: &Path) {
    let lock = match services.locks.try_lock_host(CLEANUP_LOCK).await {
        Ok(Some(lock)) => lock,
        Ok(None) => return,
        Err(e) => {
            warn!("Skipping cleanup: {}", e);
            return;
        }
    };
    match cleanup_stale_build_dirs(builds_dir, STALE_BUILD_DIR_AGE).await {
        Ok(0) => {}
        Ok(removed) => debug!("Removed {} stale build directories", removed),
        Err(e) => warn!("Build directory cleanup failed: {}", e),
    }
    if let Err(e) = services.locks.unlock(lock).await {
        warn!("Failed to release {} lock: {}", CLEANUP_LOCK, e);
    }
}
