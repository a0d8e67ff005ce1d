//! In-memory fakes for collaborator traits (testing only)
//!
//! Provides `FakeEngine`, `FakeRegistry` and `FakeGitRepo` that satisfy the
//! trait contracts without podman, a registry or a git checkout. Several
//! fake engines may share one `FakeRegistry` to simulate concurrent hosts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::build::ConveyorServices;
use crate::engine::{BuildRequest, ContainerEngine};
use crate::error::{ConveyorError, ConveyorResult};
use crate::git::{GitRepo, PathFilter, EMPTY_TREE};
use crate::lock::{LockManager, MemoryLockBackend};
use crate::registry::{Registry, RegistryVendor};
use crate::signature::content_digest;
use crate::storage::{split_reference, ImageInfo, LocalStagesStorage, StagesStorageCache};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `repo` and `repo:latest` name the same image
fn canonical(reference: &str) -> String {
    match split_reference(reference) {
        (repo, Some(tag)) => format!("{}:{}", repo, tag),
        (repo, None) => format!("{}:latest", repo),
    }
}

// ---------------------------------------------------------------------------
// FakeRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistryState {
    images: HashMap<String, ImageInfo>,
    pushes: Vec<String>,
    deletes: Vec<String>,
    refuse_deletes: bool,
}

/// In-memory registry keyed by full reference
#[derive(Debug, Default)]
pub struct FakeRegistry {
    state: Mutex<RegistryState>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `info` under its reference, as a push would
    pub fn receive(&self, info: ImageInfo) {
        let mut state = lock(&self.state);
        state.pushes.push(info.name.clone());
        state.images.insert(info.name.clone(), info);
    }

    /// References pushed so far, in order
    pub fn pushes(&self) -> Vec<String> {
        lock(&self.state).pushes.clone()
    }

    pub fn get(&self, reference: &str) -> Option<ImageInfo> {
        lock(&self.state).images.get(&canonical(reference)).cloned()
    }

    /// Reject manifest deletion, like Docker Hub does
    pub fn refuse_deletes(&self) {
        lock(&self.state).refuse_deletes = true;
    }

    /// References deletion was requested for, refused or not
    pub fn deletes(&self) -> Vec<String> {
        lock(&self.state).deletes.clone()
    }

    /// Drop a reference behind everyone's back (external cleanup)
    pub fn forget(&self, reference: &str) {
        lock(&self.state).images.remove(&canonical(reference));
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn tags(&self, repository: &str) -> ConveyorResult<Vec<String>> {
        let state = lock(&self.state);
        let mut tags: Vec<String> = state
            .images
            .values()
            .filter(|i| i.repository == repository)
            .map(|i| i.tag.clone())
            .collect();
        tags.sort();
        Ok(tags)
    }

    async fn get_artifact_info(&self, reference: &str) -> ConveyorResult<Option<ImageInfo>> {
        Ok(self.get(reference))
    }

    async fn delete(&self, reference: &str) -> ConveyorResult<()> {
        let refused = {
            let mut state = lock(&self.state);
            state.deletes.push(reference.to_string());
            state.refuse_deletes
        };
        if refused {
            return Err(ConveyorError::RegistryUnsupported {
                registry: "fake".to_string(),
                operation: "manifest deletion".to_string(),
            });
        }
        self.forget(reference);
        Ok(())
    }

    fn vendor(&self) -> RegistryVendor {
        RegistryVendor::Generic
    }
}

// ---------------------------------------------------------------------------
// FakeEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct EngineState {
    images: HashMap<String, ImageInfo>,
    builds: Vec<BuildRequest>,
    introspections: Vec<(String, Vec<String>)>,
    fail_when: Option<String>,
    counter: u64,
}

/// In-memory container engine.
///
/// Builds never fail unless told to, labels are inherited from the base
/// image like real engines do, and unknown bases are created on first use
/// (an implicit pull).
#[derive(Debug, Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
    registry: Option<Arc<FakeRegistry>>,
    build_delay: Duration,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose push/pull go to `registry`
    pub fn with_registry(registry: Arc<FakeRegistry>) -> Self {
        Self {
            registry: Some(registry),
            ..Self::default()
        }
    }

    /// Make every build take `delay`, widening race windows
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    /// Fail any build whose commands contain `needle`
    pub fn fail_builds_containing(&self, needle: &str) {
        lock(&self.state).fail_when = Some(needle.to_string());
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        lock(&self.state).builds.clone()
    }

    pub fn build_count(&self) -> usize {
        lock(&self.state).builds.len()
    }

    pub fn introspections(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.state).introspections.clone()
    }

    /// All local references, sorted
    pub fn references(&self) -> Vec<String> {
        let mut refs: Vec<String> = lock(&self.state).images.keys().cloned().collect();
        refs.sort();
        refs
    }

    /// Seed a local image
    pub fn add_image(&self, reference: &str, labels: HashMap<String, String>) -> ImageInfo {
        let id = content_digest([reference]);
        let info = ImageInfo::new(reference, &id, labels);
        lock(&self.state)
            .images
            .insert(info.name.clone(), info.clone());
        info
    }

    fn find(state: &EngineState, reference_or_id: &str) -> Option<ImageInfo> {
        state
            .images
            .get(&canonical(reference_or_id))
            .or_else(|| state.images.values().find(|i| i.id == reference_or_id))
            .cloned()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ensure_ready(&self) -> ConveyorResult<()> {
        Ok(())
    }

    async fn build(&self, request: &BuildRequest) -> ConveyorResult<String> {
        if !self.build_delay.is_zero() {
            tokio::time::sleep(self.build_delay).await;
        }

        let mut state = lock(&self.state);
        if let Some(needle) = &state.fail_when {
            if request.run_commands().iter().any(|c| c.contains(needle.as_str())) {
                return Err(ConveyorError::ImageBuild {
                    image: request.tag.clone(),
                    output: format!("command containing '{}' failed", needle),
                });
            }
        }

        let base = match Self::find(&state, &request.base) {
            Some(base) => base,
            None => {
                let base = ImageInfo::new(&request.base, &content_digest([&request.base]), HashMap::new());
                state.images.insert(base.name.clone(), base.clone());
                base
            }
        };

        state.counter += 1;
        let counter = state.counter.to_string();
        let id = content_digest([base.id.as_str(), request.tag.as_str(), counter.as_str()]);
        let mut labels = base.labels.clone();
        labels.extend(request.labels.clone());

        let info = ImageInfo::new(&request.tag, &id, labels)
            .with_created_at(Utc::now())
            .with_size(base.size + 1024);
        state.images.insert(info.name.clone(), info);
        state.builds.push(request.clone());
        Ok(id)
    }

    async fn inspect(&self, reference: &str) -> ConveyorResult<Option<ImageInfo>> {
        Ok(lock(&self.state).images.get(&canonical(reference)).cloned())
    }

    async fn list(&self, repository: &str) -> ConveyorResult<Vec<ImageInfo>> {
        let state = lock(&self.state);
        let mut images: Vec<ImageInfo> = state
            .images
            .values()
            .filter(|i| i.repository == repository)
            .cloned()
            .collect();
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    async fn tag(&self, source: &str, target: &str) -> ConveyorResult<()> {
        let mut state = lock(&self.state);
        let image = Self::find(&state, source).ok_or_else(|| ConveyorError::ImageMissing(source.to_string()))?;
        let tagged = image.retagged(target);
        state.images.insert(tagged.name.clone(), tagged);
        Ok(())
    }

    async fn push(&self, reference: &str) -> ConveyorResult<()> {
        let registry = self.registry.as_ref().ok_or_else(|| ConveyorError::ImagePush {
            image: reference.to_string(),
            reason: "no registry attached".to_string(),
        })?;
        let image = {
            let state = lock(&self.state);
            Self::find(&state, reference).ok_or_else(|| ConveyorError::ImageMissing(reference.to_string()))?
        };
        registry.receive(image);
        Ok(())
    }

    async fn pull(&self, reference: &str) -> ConveyorResult<()> {
        let image = self
            .registry
            .as_ref()
            .and_then(|r| r.get(reference))
            .ok_or_else(|| ConveyorError::ImagePull {
                image: reference.to_string(),
                reason: "manifest unknown".to_string(),
            })?;
        lock(&self.state).images.insert(image.name.clone(), image);
        Ok(())
    }

    async fn remove(&self, reference: &str) -> ConveyorResult<()> {
        lock(&self.state).images.remove(&canonical(reference));
        Ok(())
    }

    async fn introspect(&self, reference: &str, commands: &[String]) -> ConveyorResult<()> {
        lock(&self.state)
            .introspections
            .push((reference.to_string(), commands.to_vec()));
        Ok(())
    }

    fn engine_name(&self) -> &'static str {
        "Fake"
    }
}

// ---------------------------------------------------------------------------
// FakeGitRepo
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct GitState {
    history: Vec<String>,
    branch: Option<String>,
    tag: Option<String>,
}

/// Linear history whose diffs and archives are derived from commit names
#[derive(Debug, Default)]
pub struct FakeGitRepo {
    state: Mutex<GitState>,
}

impl FakeGitRepo {
    pub fn new(head: &str) -> Self {
        Self {
            state: Mutex::new(GitState {
                history: vec![head.to_string()],
                branch: Some("main".to_string()),
                tag: None,
            }),
        }
    }

    /// Append a commit and move HEAD to it
    pub fn commit(&self, id: &str) {
        let mut state = lock(&self.state);
        state.history.push(id.to_string());
        state.tag = None;
    }

    pub fn set_branch(&self, branch: Option<&str>) {
        lock(&self.state).branch = branch.map(str::to_string);
    }

    pub fn set_tag(&self, tag: Option<&str>) {
        lock(&self.state).tag = tag.map(str::to_string);
    }

    fn head(state: &GitState) -> String {
        state.history.last().cloned().unwrap_or_default()
    }

    fn position(state: &GitState, commit: &str) -> Option<usize> {
        state.history.iter().position(|c| c == commit)
    }
}

#[async_trait]
impl GitRepo for FakeGitRepo {
    async fn diff(&self, filter: &PathFilter, from: Option<&str>, to: &str) -> ConveyorResult<String> {
        Ok(format!(
            "diff {}..{} -- {}\n",
            from.unwrap_or(EMPTY_TREE),
            to,
            filter.pathspecs().join(" ")
        ))
    }

    async fn is_any_changes(&self, _filter: &PathFilter, from: &str, to: &str) -> ConveyorResult<bool> {
        Ok(from != to)
    }

    async fn archive(&self, filter: &PathFilter, commit: &str) -> ConveyorResult<Vec<u8>> {
        Ok(format!("archive {} -- {}", commit, filter.pathspecs().join(" ")).into_bytes())
    }

    async fn latest_commit(&self) -> ConveyorResult<String> {
        Ok(Self::head(&lock(&self.state)))
    }

    async fn latest_branch_commit(&self, _branch: &str) -> ConveyorResult<String> {
        Ok(Self::head(&lock(&self.state)))
    }

    async fn latest_tag_commit(&self, tag: &str) -> ConveyorResult<String> {
        let state = lock(&self.state);
        if state.tag.as_deref() == Some(tag) {
            Ok(Self::head(&state))
        } else {
            Err(ConveyorError::Git {
                command: format!("git rev-parse refs/tags/{}", tag),
                stderr: "unknown revision".to_string(),
            })
        }
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> ConveyorResult<bool> {
        let state = lock(&self.state);
        Ok(match (Self::position(&state, ancestor), Self::position(&state, descendant)) {
            (Some(a), Some(d)) => a <= d,
            _ => false,
        })
    }

    async fn current_branch(&self) -> ConveyorResult<Option<String>> {
        Ok(lock(&self.state).branch.clone())
    }

    async fn head_tag(&self) -> ConveyorResult<Option<String>> {
        Ok(lock(&self.state).tag.clone())
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Services over engine-local storage with in-process locks and no git
pub fn local_services(engine: Arc<FakeEngine>, project: &str) -> ConveyorServices {
    ConveyorServices {
        engine: engine.clone(),
        storage: Arc::new(LocalStagesStorage::new(engine)),
        cache: Arc::new(StagesStorageCache::new()),
        locks: LockManager::new(Arc::new(MemoryLockBackend::new()), project),
        git: None,
        images_registry: None,
    }
}
