//! Stages storage
//!
//! Where stage artifacts live between runs, addressed by project and
//! signature:
//! - local: images in the container engine, `image-stage-<project>:<signature>`
//! - repo: a registry repository, `<repo>:image-stage-<signature>`
//!
//! One signature may hold several records, e.g. git archives taken on
//! diverging branches. The first record gets the canonical name, later ones
//! `<canonical>-<millis>`. Records are never overwritten: publishing an image
//! that is already stored returns the existing record.

mod cache;
mod info;
mod local;
mod repo;

pub use cache::StagesStorageCache;
pub use info::{format_bytes, labels, normalize_id, split_reference, ImageInfo};
pub use local::LocalStagesStorage;
pub use repo::RepoStagesStorage;

use crate::engine::ContainerEngine;
use crate::error::ConveyorResult;
use crate::registry::Registry;
use crate::signature::Signature;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Address selecting the local stages storage
pub const LOCAL_STORAGE_ADDRESS: &str = ":local";

/// Prefix of every stage tag / repository
pub const STAGE_PREFIX: &str = "image-stage";

/// A freshly built image, not yet in stages storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHandle {
    pub project: String,
    pub signature: Signature,
    /// Engine image ID
    pub id: String,
    /// Temporary reference the engine built it under
    pub build_tag: String,
}

/// Persistent, shared store of stage artifacts
#[async_trait]
pub trait StagesStorage: Send + Sync {
    /// Human-readable address (`:local` or the repository)
    fn address(&self) -> String;

    /// Canonical reference of the artifact for `signature`
    fn stage_image_name(&self, project: &str, signature: &Signature) -> String;

    /// Whether an artifact for `signature` is stored
    async fn exists(&self, project: &str, signature: &Signature) -> ConveyorResult<bool> {
        Ok(!self.enumerate_by_signature(project, signature).await?.is_empty())
    }

    /// All stored artifacts carrying `signature`, canonical and
    /// timestamp-suffixed records alike
    async fn enumerate_by_signature(
        &self,
        project: &str,
        signature: &Signature,
    ) -> ConveyorResult<Vec<ImageInfo>>;

    /// Make `artifact` available in the local engine. Fails with
    /// `StageMissing` if the storage no longer has it.
    async fn fetch(&self, artifact: &ImageInfo) -> ConveyorResult<ImageInfo>;

    /// Store a built artifact next to the existing records of its signature
    async fn publish(&self, handle: &ArtifactHandle) -> ConveyorResult<ImageInfo>;

    /// Remove a stored artifact
    async fn delete(&self, artifact: &ImageInfo) -> ConveyorResult<()>;
}

/// Whether `tag` names an artifact for `signature` under `prefix`
/// (`<prefix><signature>` or `<prefix><signature>-<millis>`)
pub(crate) fn tag_matches_signature(tag: &str, prefix: &str, signature: &Signature) -> bool {
    let Some(rest) = tag.strip_prefix(prefix) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix(signature.as_str()) else {
        return false;
    };
    match rest.strip_prefix('-') {
        None => rest.is_empty(),
        Some(millis) => !millis.is_empty() && millis.bytes().all(|b| b.is_ascii_digit()),
    }
}

/// Record of `existing` holding the image `id`, if it is stored already
pub(crate) fn stored_record(existing: &[ImageInfo], id: &str) -> Option<ImageInfo> {
    existing
        .iter()
        .find(|i| normalize_id(&i.id) == normalize_id(id))
        .cloned()
}

/// Name for a new record: `canonical` while it is free, otherwise
/// `<canonical>-<millis>` not taken by any of `existing`
pub(crate) fn new_record_name(canonical: &str, existing: &[ImageInfo]) -> String {
    let taken = |name: &str| existing.iter().any(|i| i.name == name);
    if !taken(canonical) {
        return canonical.to_string();
    }
    let mut millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    loop {
        let name = format!("{}-{}", canonical, millis);
        if !taken(&name) {
            return name;
        }
        millis += 1;
    }
}

/// Create the stages storage named by `address`.
///
/// `:local` selects the engine-local storage; anything else is a registry
/// repository, optionally narrowed by `image` (`<repo>/<image>`).
pub fn create_stages_storage(
    address: &str,
    image: Option<&str>,
    engine: Arc<dyn ContainerEngine>,
    registry: Option<Arc<dyn Registry>>,
) -> ConveyorResult<Arc<dyn StagesStorage>> {
    if address == LOCAL_STORAGE_ADDRESS {
        return Ok(Arc::new(LocalStagesStorage::new(engine)));
    }
    let registry = registry.ok_or_else(|| {
        crate::error::ConveyorError::User(format!(
            "stages storage {} needs registry access",
            address
        ))
    })?;
    let repository = match image {
        Some(image) if !image.is_empty() => format!("{}/{}", address.trim_end_matches('/'), image),
        _ => address.trim_end_matches('/').to_string(),
    };
    Ok(Arc::new(RepoStagesStorage::new(repository, engine, registry)))
}
