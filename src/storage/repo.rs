//! Stages storage in a registry repository

use super::{
    new_record_name, stored_record, tag_matches_signature, ArtifactHandle, ImageInfo,
    StagesStorage, STAGE_PREFIX,
};
use crate::engine::ContainerEngine;
use crate::error::{ConveyorError, ConveyorResult};
use crate::registry::Registry;
use crate::signature::Signature;
use async_trait::async_trait;
use futures_util::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Stage artifacts kept as `<repo>:image-stage-<signature>[-<millis>]` tags
pub struct RepoStagesStorage {
    repository: String,
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<dyn Registry>,
}

impl RepoStagesStorage {
    pub fn new(
        repository: impl Into<String>,
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        Self {
            repository: repository.into(),
            engine,
            registry,
        }
    }

    fn tag_prefix() -> String {
        format!("{}-", STAGE_PREFIX)
    }

    fn missing(&self, name: &str) -> ConveyorError {
        ConveyorError::StageMissing {
            name: name.to_string(),
            storage: self.repository.clone(),
        }
    }
}

#[async_trait]
impl StagesStorage for RepoStagesStorage {
    fn address(&self) -> String {
        self.repository.clone()
    }

    fn stage_image_name(&self, _project: &str, signature: &Signature) -> String {
        format!("{}:{}{}", self.repository, Self::tag_prefix(), signature)
    }

    async fn enumerate_by_signature(
        &self,
        _project: &str,
        signature: &Signature,
    ) -> ConveyorResult<Vec<ImageInfo>> {
        let prefix = Self::tag_prefix();
        let tags = self.registry.tags(&self.repository).await?;
        let lookups = tags
            .iter()
            .filter(|t| tag_matches_signature(t, &prefix, signature))
            .map(|t| {
                let reference = format!("{}:{}", self.repository, t);
                let registry = self.registry.clone();
                async move { registry.get_artifact_info(&reference).await }
            });
        let found = try_join_all(lookups).await?;
        Ok(found.into_iter().flatten().collect())
    }

    async fn fetch(&self, artifact: &ImageInfo) -> ConveyorResult<ImageInfo> {
        if let Some(local) = self.engine.inspect(&artifact.name).await? {
            return Ok(local);
        }
        if let Err(e) = self.engine.pull(&artifact.name).await {
            if self.registry.get_artifact_info(&artifact.name).await?.is_none() {
                return Err(self.missing(&artifact.name));
            }
            return Err(e);
        }
        self.engine
            .inspect(&artifact.name)
            .await?
            .ok_or_else(|| self.missing(&artifact.name))
    }

    async fn publish(&self, handle: &ArtifactHandle) -> ConveyorResult<ImageInfo> {
        let existing = self
            .enumerate_by_signature(&handle.project, &handle.signature)
            .await?;
        if let Some(stored) = stored_record(&existing, &handle.id) {
            debug!("{} already stored, keeping existing record", stored.name);
            return Ok(stored);
        }

        let canonical = self.stage_image_name(&handle.project, &handle.signature);
        let name = new_record_name(&canonical, &existing);

        self.engine.tag(&handle.id, &name).await?;
        self.registry.push(self.engine.as_ref(), &name).await?;
        if handle.build_tag != name {
            if let Err(e) = self.engine.remove(&handle.build_tag).await {
                warn!("Failed to remove build tag {}: {}", handle.build_tag, e);
            }
        }

        match self.registry.get_artifact_info(&name).await? {
            Some(info) => Ok(info),
            None => self
                .engine
                .inspect(&name)
                .await?
                .ok_or(ConveyorError::ImageMissing(name)),
        }
    }

    async fn delete(&self, artifact: &ImageInfo) -> ConveyorResult<()> {
        debug!("Deleting stage {} from {}", artifact.name, self.repository);
        self.registry.delete(&artifact.name).await?;
        if let Err(e) = self.engine.remove(&artifact.name).await {
            warn!("Failed to remove local copy of {}: {}", artifact.name, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BuildRequest;
    use crate::fakes::{FakeEngine, FakeRegistry};

    const REPO: &str = "registry.local/demo/stages";

    fn setup() -> (Arc<FakeRegistry>, Arc<FakeEngine>, RepoStagesStorage) {
        let registry = Arc::new(FakeRegistry::new());
        let engine = Arc::new(FakeEngine::with_registry(registry.clone()));
        let storage = RepoStagesStorage::new(REPO, engine.clone(), registry.clone());
        (registry, engine, storage)
    }

    async fn handle(engine: &FakeEngine, sig: &str) -> ArtifactHandle {
        let tag = format!("tmp-{}", sig);
        let id = engine.build(&BuildRequest::new("alpine", &tag)).await.unwrap();
        ArtifactHandle {
            project: "demo".to_string(),
            signature: Signature::from_hex(sig),
            id,
            build_tag: tag,
        }
    }

    #[tokio::test]
    async fn publish_pushes_once() {
        let (registry, engine, storage) = setup();
        let built = handle(&engine, "abc").await;
        let info = storage.publish(&built).await.unwrap();
        assert_eq!(info.name, format!("{}:image-stage-abc", REPO));
        assert_eq!(registry.pushes().len(), 1);

        assert_eq!(storage.publish(&built).await.unwrap(), info);
        assert_eq!(registry.pushes().len(), 1);

        let sig = Signature::from_hex("abc");
        assert!(storage.exists("demo", &sig).await.unwrap());
        assert!(!storage.exists("demo", &Signature::from_hex("abd")).await.unwrap());
    }

    #[tokio::test]
    async fn rebuilt_content_keeps_earlier_record() {
        let (registry, engine, storage) = setup();
        let first = storage.publish(&handle(&engine, "abc").await).await.unwrap();
        let second = storage.publish(&handle(&engine, "abc").await).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(registry.pushes().len(), 2);
        assert_eq!(registry.get(&first.name).map(|i| i.id), Some(first.id));
        let records = storage
            .enumerate_by_signature("demo", &Signature::from_hex("abc"))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn fetch_pulls_missing_local_copy() {
        let (_registry, engine, storage) = setup();
        let info = storage.publish(&handle(&engine, "abc").await).await.unwrap();
        engine.remove(&info.name).await.unwrap();

        let fetched = storage.fetch(&info).await.unwrap();
        assert_eq!(fetched.id, info.id);
        assert!(engine.inspect(&info.name).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fetch_after_remote_delete_reports_missing() {
        let (_registry, engine, storage) = setup();
        let info = storage.publish(&handle(&engine, "abc").await).await.unwrap();
        storage.delete(&info).await.unwrap();
        assert!(matches!(
            storage.fetch(&info).await,
            Err(ConveyorError::StageMissing { .. })
        ));
    }
}
