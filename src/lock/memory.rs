//! In-process lock backend for single-host runs and tests

use super::{LockBackend, LockGuard, LockHandle};
use crate::error::ConveyorResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Locks held in memory, shared by every task holding the same backend
#[derive(Default)]
pub struct MemoryLockBackend {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn acquire(&self, key: &str, blocking: bool) -> ConveyorResult<Option<LockHandle>> {
        let mutex = self.entry(key);
        let guard = if blocking {
            Some(mutex.lock_owned().await)
        } else {
            mutex.try_lock_owned().ok()
        };
        Ok(guard.map(|g| LockHandle::new(key, LockGuard::Memory(g))))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
