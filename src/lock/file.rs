//! Advisory file locks, shared by all processes on a host

use super::{LockBackend, LockGuard, LockHandle};
use crate::error::{ConveyorError, ConveyorResult};
use async_trait::async_trait;
use fs4::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Locks backed by `flock`-style locks on files in one directory
pub struct FileLockBackend {
    dir: PathBuf,
}

impl FileLockBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock file for `key`. Keys may contain `/` and `:`, so the readable
    /// part is sanitized and a short hash keeps distinct keys apart.
    pub fn lock_path(&self, key: &str) -> PathBuf {
        let readable: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let hash = Sha256::digest(key.as_bytes());
        self.dir
            .join(format!("{}-{}.lock", readable, hex::encode(&hash[..4])))
    }

    fn open(&self, path: &Path) -> ConveyorResult<File> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            ConveyorError::io(format!("creating lock directory {}", self.dir.display()), e)
        })?;
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ConveyorError::io(format!("opening lock file {}", path.display()), e))
    }
}

#[async_trait]
impl LockBackend for FileLockBackend {
    async fn acquire(&self, key: &str, blocking: bool) -> ConveyorResult<Option<LockHandle>> {
        let path = self.lock_path(key);
        let file = self.open(&path)?;
        let key_owned = key.to_string();

        let locked = tokio::task::spawn_blocking(move || {
            if blocking {
                file.lock_exclusive().map(|_| Some(file))
            } else {
                match file.try_lock_exclusive() {
                    Ok(()) => Ok(Some(file)),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
                    Err(e) => Err(e),
                }
            }
        })
        .await
        .map_err(|e| ConveyorError::LockAcquire {
            key: key_owned.clone(),
            reason: e.to_string(),
        })?
        .map_err(|e| ConveyorError::LockAcquire {
            key: key_owned.clone(),
            reason: e.to_string(),
        })?;

        if locked.is_some() {
            debug!("Locked {} ({})", key_owned, path.display());
        }
        Ok(locked.map(|file| LockHandle::new(key_owned, LockGuard::File(file))))
    }

    async fn release(&self, handle: LockHandle) -> ConveyorResult<()> {
        // Closing the descriptor releases the lock
        drop(handle);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}
