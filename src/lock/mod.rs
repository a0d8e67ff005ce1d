//! Named locks shared between concurrent Conveyor processes
//!
//! Keys are namespaced by scope. Stage build, stage cache and image locks
//! are per project; host locks are shared by every project on the machine.
//! Each lock is held through a [`LockHandle`], which releases on drop.
//! File locks cover one host; runners on several hosts sharing a remote
//! stages storage coordinate through a lock server ([`HttpLockBackend`]).

mod file;
mod http;
mod memory;

pub use file::FileLockBackend;
pub use http::HttpLockBackend;
pub use memory::MemoryLockBackend;

use crate::error::{ConveyorError, ConveyorResult};
use crate::signature::Signature;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// What a lock protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    /// Writer of new artifacts for one signature
    StageBuild,
    /// Refresh of one signature's storage cache entry
    StageCache,
    /// Publication of one final image tag
    Image,
    /// Machine-wide housekeeping
    Host,
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StageBuild => write!(f, "stage"),
            Self::StageCache => write!(f, "stage-cache"),
            Self::Image => write!(f, "image"),
            Self::Host => write!(f, "host"),
        }
    }
}

/// Backend-specific state that keeps a lock held
pub(crate) enum LockGuard {
    File(std::fs::File),
    Memory(tokio::sync::OwnedMutexGuard<()>),
    Http(http::Lease),
}

/// A held lock. Dropping the handle releases it.
pub struct LockHandle {
    key: String,
    guard: LockGuard,
}

impl LockHandle {
    pub(crate) fn new(key: impl Into<String>, guard: LockGuard) -> Self {
        Self {
            key: key.into(),
            guard,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle").field("key", &self.key).finish()
    }
}

/// Storage for named locks
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Acquire `key`. Blocking acquisition waits until the lock is free;
    /// non-blocking acquisition returns `None` if it is held elsewhere.
    async fn acquire(&self, key: &str, blocking: bool) -> ConveyorResult<Option<LockHandle>>;

    /// Release a held lock
    async fn release(&self, handle: LockHandle) -> ConveyorResult<()> {
        drop(handle);
        Ok(())
    }

    /// Backend name for diagnostics
    fn backend_name(&self) -> &'static str;
}

/// Scoped lock operations for one project
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    project: String,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, project: impl Into<String>) -> Self {
        Self {
            backend,
            project: project.into(),
        }
    }

    /// Fully qualified key for a lock in `scope`
    pub fn key(&self, scope: LockScope, name: &str) -> String {
        match scope {
            LockScope::Host => format!("{}.{}", scope, name),
            _ => format!("{}.{}.{}", self.project, scope, name),
        }
    }

    /// Exclusive right to build and publish artifacts for `signature`
    pub async fn lock_stage(&self, signature: &Signature) -> ConveyorResult<LockHandle> {
        self.acquire_blocking(LockScope::StageBuild, signature.as_str())
            .await
    }

    /// Exclusive right to refresh the cache entry for `signature`
    pub async fn lock_stage_cache(&self, signature: &Signature) -> ConveyorResult<LockHandle> {
        self.acquire_blocking(LockScope::StageCache, signature.as_str())
            .await
    }

    /// Exclusive right to publish the final image `reference`
    pub async fn lock_image(&self, reference: &str) -> ConveyorResult<LockHandle> {
        self.acquire_blocking(LockScope::Image, reference).await
    }

    /// Try to take a host-wide lock without waiting
    pub async fn try_lock_host(&self, name: &str) -> ConveyorResult<Option<LockHandle>> {
        let key = self.key(LockScope::Host, name);
        let handle = self.backend.acquire(&key, false).await?;
        if handle.is_none() {
            debug!("Host lock {} is held elsewhere", key);
        }
        Ok(handle)
    }

    pub async fn unlock(&self, handle: LockHandle) -> ConveyorResult<()> {
        debug!("Releasing lock {}", handle.key());
        self.backend.release(handle).await
    }

    async fn acquire_blocking(&self, scope: LockScope, name: &str) -> ConveyorResult<LockHandle> {
        let key = self.key(scope, name);
        debug!("Acquiring lock {}", key);
        self.backend
            .acquire(&key, true)
            .await?
            .ok_or_else(|| ConveyorError::LockAcquire {
                key,
                reason: format!("{} backend returned no handle", self.backend.backend_name()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryLockBackend::new()), "demo")
    }

    #[test]
    fn keys_are_scoped() {
        let locks = manager();
        assert_eq!(locks.key(LockScope::StageBuild, "abc"), "demo.stage.abc");
        assert_eq!(
            locks.key(LockScope::StageCache, "abc"),
            "demo.stage-cache.abc"
        );
        assert_eq!(locks.key(LockScope::Image, "r/app:v1"), "demo.image.r/app:v1");
        assert_eq!(locks.key(LockScope::Host, "gc"), "host.gc");
    }

    #[tokio::test]
    async fn host_lock_is_non_blocking() {
        let locks = manager();
        let held = locks.try_lock_host("gc").await.unwrap();
        assert!(held.is_some());
        assert!(locks.try_lock_host("gc").await.unwrap().is_none());
        drop(held);
        assert!(locks.try_lock_host("gc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stage_lock_waits_for_release() {
        let locks = manager();
        let sig = Signature::from_hex("abc");
        let first = locks.lock_stage(&sig).await.unwrap();

        let other = locks.clone();
        let sig2 = sig.clone();
        let waiter = tokio::spawn(async move { other.lock_stage(&sig2).await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        locks.unlock(first).await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn build_and_cache_locks_are_independent() {
        let locks = manager();
        let sig = Signature::from_hex("abc");
        let _build = locks.lock_stage(&sig).await.unwrap();
        let cache = tokio::time::timeout(Duration::from_secs(1), locks.lock_stage_cache(&sig)).await;
        assert!(cache.is_ok());
    }
}
