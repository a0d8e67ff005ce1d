//! Container engine access
//!
//! Provides engine-agnostic image operations:
//! - Podman or Docker through their CLIs
//! - In-memory fakes for tests (see `crate::fakes`)

mod cli;
pub mod dockerfile;
mod factory;
mod runtime;

pub use cli::{CliEngine, EngineKind};
pub use factory::create_engine;
pub use runtime::{BuildRequest, ContainerEngine, Instruction};

use crate::error::{ConveyorError, ConveyorResult};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

/// Max number of output lines to include in build error messages.
const BUILD_ERROR_TAIL_LINES: usize = 50;

/// Build directories older than this are left over from crashed runs.
pub const STALE_BUILD_DIR_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Extract the useful tail of build output for error diagnostics.
///
/// Combines stdout and stderr, then returns the last `BUILD_ERROR_TAIL_LINES`
/// lines so error messages are actionable without being overwhelming.
pub(crate) fn build_error_output(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let total = lines.len();
    let tail: Vec<&str> = if total > BUILD_ERROR_TAIL_LINES {
        lines[total - BUILD_ERROR_TAIL_LINES..].to_vec()
    } else {
        lines
    };
    tail.join("\n")
}

/// Stream stdout+stderr from a child process, calling `on_output` for each line.
///
/// Returns all collected output lines for error reporting. This is a standalone
/// async function (not behind `async_trait`) to avoid lifetime issues with the
/// `dyn Fn` callback.
pub(crate) async fn stream_child_output(
    child: &mut tokio::process::Child,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> Vec<String> {
    let (Some(stderr), Some(stdout)) = (child.stderr.take(), child.stdout.take()) else {
        return Vec::new();
    };

    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout_reader = BufReader::new(stdout).lines();

    let mut all_output = Vec::new();
    let mut stderr_done = false;
    let mut stdout_done = false;

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = stderr_reader.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    _ => stderr_done = true,
                }
            }
            line = stdout_reader.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    _ => stdout_done = true,
                }
            }
        }
    }

    all_output
}

/// Remove build directories older than `max_age`.
///
/// Callers hold the host housekeeping lock, so two processes never race on
/// the same directory. Returns the number of directories removed.
pub async fn cleanup_stale_build_dirs(builds_dir: &Path, max_age: Duration) -> ConveyorResult<usize> {
    let mut entries = match tokio::fs::read_dir(builds_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(ConveyorError::io("reading builds directory", e)),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ConveyorError::io("reading builds directory", e))?
    {
        let path = entry.path();
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age < max_age || !path.is_dir() {
            continue;
        }
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!("Removed stale build dir {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn build_error_output_keeps_tail() {
        let stdout: String = (0..80).map(|i| format!("line {}\n", i)).collect();
        let tail = build_error_output(&stdout, "fatal: boom");
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), BUILD_ERROR_TAIL_LINES);
        assert_eq!(lines.last(), Some(&"fatal: boom"));
    }

    #[tokio::test]
    async fn cleanup_missing_dir_is_noop() {
        let temp = TempDir::new().unwrap();
        let removed = cleanup_stale_build_dirs(&temp.path().join("missing"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn cleanup_respects_age() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("b1")).unwrap();
        std::fs::create_dir(temp.path().join("b2")).unwrap();

        let kept = cleanup_stale_build_dirs(temp.path(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(kept, 0);

        let removed = cleanup_stale_build_dirs(temp.path(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(!temp.path().join("b1").exists());
    }
}
