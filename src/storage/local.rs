//! Stages storage in the local container engine

use super::{
    new_record_name, stored_record, tag_matches_signature, ArtifactHandle, ImageInfo,
    StagesStorage, LOCAL_STORAGE_ADDRESS, STAGE_PREFIX,
};
use crate::engine::ContainerEngine;
use crate::error::{ConveyorError, ConveyorResult};
use crate::signature::Signature;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Stage artifacts kept as `image-stage-<project>:<signature>[-<millis>]` images
pub struct LocalStagesStorage {
    engine: Arc<dyn ContainerEngine>,
}

impl LocalStagesStorage {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    fn repository(project: &str) -> String {
        format!("{}-{}", STAGE_PREFIX, project)
    }
}

#[async_trait]
impl StagesStorage for LocalStagesStorage {
    fn address(&self) -> String {
        LOCAL_STORAGE_ADDRESS.to_string()
    }

    fn stage_image_name(&self, project: &str, signature: &Signature) -> String {
        format!("{}:{}", Self::repository(project), signature)
    }

    async fn enumerate_by_signature(
        &self,
        project: &str,
        signature: &Signature,
    ) -> ConveyorResult<Vec<ImageInfo>> {
        let images = self.engine.list(&Self::repository(project)).await?;
        Ok(images
            .into_iter()
            .filter(|i| tag_matches_signature(&i.tag, "", signature))
            .collect())
    }

    async fn fetch(&self, artifact: &ImageInfo) -> ConveyorResult<ImageInfo> {
        self.engine
            .inspect(&artifact.name)
            .await?
            .ok_or_else(|| ConveyorError::StageMissing {
                name: artifact.name.clone(),
                storage: self.address(),
            })
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
        if handle.build_tag != name {
            if let Err(e) = self.engine.remove(&handle.build_tag).await {
                warn!("Failed to remove build tag {}: {}", handle.build_tag, e);
            }
        }
        self.engine
            .inspect(&name)
            .await?
            .ok_or(ConveyorError::ImageMissing(name))
    }

    async fn delete(&self, artifact: &ImageInfo) -> ConveyorResult<()> {
        debug!("Deleting local stage {}", artifact.name);
        self.engine.remove(&artifact.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BuildRequest;
    use crate::fakes::FakeEngine;

    async fn built(engine: &FakeEngine, tag: &str) -> ArtifactHandle {
        let id = engine.build(&BuildRequest::new("alpine", tag)).await.unwrap();
        ArtifactHandle {
            project: "demo".to_string(),
            signature: Signature::from_hex("abc"),
            id,
            build_tag: tag.to_string(),
        }
    }

    #[tokio::test]
    async fn publish_is_idempotent() {
        let engine = Arc::new(FakeEngine::new());
        let storage = LocalStagesStorage::new(engine.clone());
        let sig = Signature::from_hex("abc");

        assert!(!storage.exists("demo", &sig).await.unwrap());
        let handle = built(&engine, "tmp-1").await;
        let first = storage.publish(&handle).await.unwrap();
        assert_eq!(first.name, "image-stage-demo:abc");
        assert!(storage.exists("demo", &sig).await.unwrap());
        assert!(engine.inspect("tmp-1").await.unwrap().is_none());

        let again = storage.publish(&handle).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(storage.enumerate_by_signature("demo", &sig).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn other_content_is_stored_alongside() {
        let engine = Arc::new(FakeEngine::new());
        let storage = LocalStagesStorage::new(engine.clone());
        let sig = Signature::from_hex("abc");

        let first = storage.publish(&built(&engine, "tmp-1").await).await.unwrap();
        let second = storage.publish(&built(&engine, "tmp-2").await).await.unwrap();
        assert_ne!(second.id, first.id);
        assert!(second.tag.starts_with("abc-"));
        assert_eq!(engine.inspect(&first.name).await.unwrap(), Some(first));
        assert_eq!(storage.enumerate_by_signature("demo", &sig).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fetch_missing_artifact() {
        let engine = Arc::new(FakeEngine::new());
        let storage = LocalStagesStorage::new(engine.clone());
        let info = storage.publish(&built(&engine, "tmp").await).await.unwrap();
        storage.delete(&info).await.unwrap();
        match storage.fetch(&info).await {
            Err(ConveyorError::StageMissing { name, .. }) => assert_eq!(name, info.name),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn enumerate_includes_legacy_tags() {
        let engine = Arc::new(FakeEngine::new());
        let storage = LocalStagesStorage::new(engine.clone());
        let handle = built(&engine, "tmp").await;
        engine
            .tag(&handle.id, "image-stage-demo:abc-1700000000000")
            .await
            .unwrap();
        engine.tag(&handle.id, "image-stage-demo:abcdef").await.unwrap();
        engine.tag(&handle.id, "image-stage-other:abc").await.unwrap();

        let found = storage
            .enumerate_by_signature("demo", &Signature::from_hex("abc"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tag, "abc-1700000000000");
    }
}
