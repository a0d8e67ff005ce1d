//! Podman/Docker CLI engine
//!
//! Implements the ContainerEngine trait by shelling out to the engine
//! binary. Builds render a Dockerfile into a throwaway directory under the
//! builds directory.

use crate::engine::dockerfile;
use crate::engine::runtime::{BuildRequest, ContainerEngine};
use crate::error::{ConveyorError, ConveyorResult};
use crate::storage::{split_reference, ImageInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Which CLI the engine drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Podman,
    Docker,
}

impl EngineKind {
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Podman => "podman",
            Self::Docker => "docker",
        }
    }

    /// Check if the binary is installed
    pub async fn installed(&self) -> bool {
        Command::new(self.binary())
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRecord {
    id: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    config: Option<InspectConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

/// Container engine driving the podman or docker CLI
pub struct CliEngine {
    kind: EngineKind,
    builds_dir: PathBuf,
}

impl CliEngine {
    /// Create a new CLI engine writing build contexts under `builds_dir`
    pub fn new(kind: EngineKind, builds_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            builds_dir: builds_dir.into(),
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Execute an engine command and return the output
    async fn exec(&self, args: &[&str]) -> ConveyorResult<std::process::Output> {
        debug!("Executing: {} {:?}", self.kind.binary(), args);

        Command::new(self.kind.binary())
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ConveyorError::command_failed(format!("{} {:?}", self.kind.binary(), args), e))
    }

    /// Execute an engine command interactively
    async fn exec_interactive(&self, args: &[&str]) -> ConveyorResult<i32> {
        debug!("Executing interactively: {} {:?}", self.kind.binary(), args);

        let status = Command::new(self.kind.binary())
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| ConveyorError::command_failed(format!("{} {:?}", self.kind.binary(), args), e))?;

        Ok(status.code().unwrap_or(-1))
    }

    /// Write the rendered Dockerfile and context files into a fresh directory
    async fn prepare_build_dir(&self, request: &BuildRequest) -> ConveyorResult<PathBuf> {
        let build_dir = self.builds_dir.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&build_dir)
            .await
            .map_err(|e| ConveyorError::io("creating build directory", e))?;

        let rendered = dockerfile::render(request);
        for (name, content) in &rendered.files {
            tokio::fs::write(build_dir.join(name), content)
                .await
                .map_err(|e| ConveyorError::io(format!("writing {}", name), e))?;
        }
        tokio::fs::write(build_dir.join("Dockerfile"), &rendered.dockerfile)
            .await
            .map_err(|e| ConveyorError::io("writing Dockerfile", e))?;

        Ok(build_dir)
    }

    async fn build_in(&self, build_dir: &Path, request: &BuildRequest) -> ConveyorResult<()> {
        let context = build_dir.display().to_string();
        let mut args: Vec<String> = vec!["build".into(), "-t".into(), request.tag.clone()];
        for volume in &request.volumes {
            args.push("--volume".into());
            args.push(volume.clone());
        }
        args.push(context);

        debug!("Building image: {} {:?}", self.kind.binary(), args);
        let mut child = Command::new(self.kind.binary())
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ConveyorError::command_failed(format!("{} build", self.kind.binary()), e))?;

        let all_output = super::stream_child_output(&mut child, &|line: String| debug!("| {}", line)).await;

        let status = child
            .wait()
            .await
            .map_err(|e| ConveyorError::command_failed(format!("{} build", self.kind.binary()), e))?;

        if !status.success() {
            let combined = all_output.join("\n");
            return Err(ConveyorError::ImageBuild {
                image: request.tag.clone(),
                output: super::build_error_output(&combined, ""),
            });
        }
        Ok(())
    }

    fn parse_inspect(reference: &str, stdout: &[u8]) -> ConveyorResult<Option<ImageInfo>> {
        let records: Vec<InspectRecord> = serde_json::from_slice(stdout)?;
        let Some(record) = records.into_iter().next() else {
            return Ok(None);
        };
        let labels = record
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();
        let mut info = ImageInfo::new(reference, &record.id, labels).with_size(record.size);
        if let Some(created) = record
            .created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        {
            info = info.with_created_at(created.with_timezone(&Utc));
        }
        Ok(Some(info))
    }
}

#[async_trait]
impl ContainerEngine for CliEngine {
    async fn ensure_ready(&self) -> ConveyorResult<()> {
        if !self.kind.installed().await {
            return Err(ConveyorError::EngineNotFound(self.kind.binary().to_string()));
        }
        Ok(())
    }

    async fn build(&self, request: &BuildRequest) -> ConveyorResult<String> {
        let build_dir = self.prepare_build_dir(request).await?;
        let result = self.build_in(&build_dir, request).await;

        // Clean up build directory (best-effort)
        if let Err(e) = tokio::fs::remove_dir_all(&build_dir).await {
            warn!("Failed to remove build dir {}: {}", build_dir.display(), e);
        }
        result?;

        let info = self
            .inspect(&request.tag)
            .await?
            .ok_or_else(|| ConveyorError::ImageMissing(request.tag.clone()))?;
        Ok(info.id)
    }

    async fn inspect(&self, reference: &str) -> ConveyorResult<Option<ImageInfo>> {
        let output = self.exec(&["image", "inspect", reference]).await?;
        if !output.status.success() {
            debug!("Image {} not found locally", reference);
            return Ok(None);
        }
        Self::parse_inspect(reference, &output.stdout)
    }

    async fn list(&self, repository: &str) -> ConveyorResult<Vec<ImageInfo>> {
        let filter = format!("reference={}", repository);
        let output = self
            .exec(&["images", "--format", "{{.Repository}}:{{.Tag}}", "--filter", &filter])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConveyorError::command_exec(
                format!("{} images", self.kind.binary()),
                stderr,
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut images = Vec::new();
        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            // Podman qualifies unqualified names with localhost/
            let reference = line.strip_prefix("localhost/").unwrap_or(line);
            let (repo, tag) = split_reference(reference);
            if repo != repository || tag.is_none() || tag == Some("<none>") {
                continue;
            }
            if let Some(info) = self.inspect(reference).await? {
                images.push(info);
            }
        }
        Ok(images)
    }

    async fn tag(&self, source: &str, target: &str) -> ConveyorResult<()> {
        debug!("Tagging {} as {}", source, target);
        let output = self.exec(&["tag", source, target]).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ConveyorError::command_exec(
                format!("{} tag", self.kind.binary()),
                stderr,
            ))
        }
    }

    async fn push(&self, reference: &str) -> ConveyorResult<()> {
        info!("Pushing image: {}", reference);
        let output = self.exec(&["push", reference]).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ConveyorError::ImagePush {
                image: reference.to_string(),
                reason: stderr.trim().to_string(),
            })
        }
    }

    async fn pull(&self, reference: &str) -> ConveyorResult<()> {
        info!("Pulling image: {}", reference);
        let output = self.exec(&["pull", reference]).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ConveyorError::ImagePull {
                image: reference.to_string(),
                reason: stderr.trim().to_string(),
            })
        }
    }

    async fn remove(&self, reference: &str) -> ConveyorResult<()> {
        debug!("Removing image: {}", reference);
        let output = self.exec(&["rmi", reference]).await?;
        if output.status.success() {
            return Ok(());
        }
        // Ignore error if image doesn't exist
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("image not known") || stderr.contains("No such image") {
            Ok(())
        } else {
            Err(ConveyorError::command_exec(
                format!("{} rmi", self.kind.binary()),
                stderr,
            ))
        }
    }

    async fn introspect(&self, reference: &str, commands: &[String]) -> ConveyorResult<()> {
        let mut script = commands.join("\n");
        if !script.is_empty() {
            script.push('\n');
        }
        script.push_str("exec /bin/sh");

        eprintln!("Introspecting {}. Exit the shell to continue.", reference);
        let code = self
            .exec_interactive(&[
                "run",
                "-it",
                "--rm",
                "--entrypoint",
                "/bin/sh",
                reference,
                "-c",
                &script,
            ])
            .await?;
        debug!("Introspection shell exited with code {}", code);
        Ok(())
    }

    fn engine_name(&self) -> &'static str {
        match self.kind {
            EngineKind::Podman => "Podman",
            EngineKind::Docker => "Docker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_names() {
        assert_eq!(CliEngine::new(EngineKind::Podman, "/tmp").engine_name(), "Podman");
        assert_eq!(CliEngine::new(EngineKind::Docker, "/tmp").engine_name(), "Docker");
    }

    #[test]
    fn parse_inspect_output() {
        let stdout = br#"[{
            "Id": "sha256:0123abcd",
            "Created": "2024-05-01T10:00:00.123456789Z",
            "Size": 4096,
            "Config": {"Labels": {"io.conveyor.signature": "abc"}}
        }]"#;
        let info = CliEngine::parse_inspect("image-stage-demo:abc", stdout)
            .unwrap()
            .unwrap();
        assert_eq!(info.id, "0123abcd");
        assert_eq!(info.size, 4096);
        assert_eq!(info.signature(), Some("abc"));
        assert_eq!(info.created_at.to_rfc3339(), "2024-05-01T10:00:00.123456789+00:00");
    }

    #[test]
    fn parse_inspect_null_labels() {
        let stdout = br#"[{"Id": "x", "Config": {"Labels": null}}]"#;
        let info = CliEngine::parse_inspect("alpine", stdout).unwrap().unwrap();
        assert!(info.labels.is_empty());
    }

    #[test]
    fn parse_inspect_empty_array() {
        assert!(CliEngine::parse_inspect("alpine", b"[]").unwrap().is_none());
    }
}
