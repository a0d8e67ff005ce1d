//! Process-wide cache of stages storage lookups
//!
//! Registry lookups are slow, so each (project, signature) is queried at
//! most once per run. Misses are refreshed under the stage-cache lock and
//! re-checked after locking, so concurrent lookups of one signature reach
//! the storage once. The cache outlives a single conveyor run and is only
//! cleared by [`StagesStorageCache::invalidate`].

use super::{ImageInfo, StagesStorage};
use crate::error::ConveyorResult;
use crate::lock::LockManager;
use crate::signature::Signature;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

type CacheKey = (String, Signature);

#[derive(Default)]
pub struct StagesStorageCache {
    entries: Mutex<HashMap<CacheKey, Vec<ImageInfo>>>,
}

impl StagesStorageCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(project: &str, signature: &Signature) -> CacheKey {
        (project.to_string(), signature.clone())
    }

    /// Cached artifacts for `signature`, without touching storage
    pub fn get(&self, project: &str, signature: &Signature) -> Option<Vec<ImageInfo>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&Self::key(project, signature)).cloned()
    }

    /// Artifacts for `signature`, querying storage on a miss.
    ///
    /// Returns whether the answer came from the cache, and the list.
    pub async fn lookup(
        &self,
        project: &str,
        signature: &Signature,
        storage: &dyn StagesStorage,
        locks: &LockManager,
    ) -> ConveyorResult<(bool, Vec<ImageInfo>)> {
        if let Some(images) = self.get(project, signature) {
            return Ok((true, images));
        }

        let lock = locks.lock_stage_cache(signature).await?;
        if let Some(images) = self.get(project, signature) {
            locks.unlock(lock).await?;
            return Ok((true, images));
        }

        debug!(
            "Stages cache miss for {}, querying {}",
            signature.short(),
            storage.address()
        );
        let result = storage.enumerate_by_signature(project, signature).await;
        if let Ok(images) = &result {
            self.insert(project, signature, images.clone());
        }
        let unlocked = locks.unlock(lock).await;
        let images = result?;
        unlocked?;
        Ok((false, images))
    }

    /// Replace the cached list for `signature`
    pub async fn store(
        &self,
        project: &str,
        signature: &Signature,
        images: Vec<ImageInfo>,
        locks: &LockManager,
    ) -> ConveyorResult<()> {
        let lock = locks.lock_stage_cache(signature).await?;
        self.insert(project, signature, images);
        locks.unlock(lock).await
    }

    /// Drop every entry
    pub fn invalidate(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("Invalidating stages cache ({} entries)", entries.len());
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, project: &str, signature: &Signature, images: Vec<ImageInfo>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(Self::key(project, signature), images);
    }
}
