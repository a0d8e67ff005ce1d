//! Build report
//!
//! A JSON summary of what a run reused, built and published, written for CI
//! systems that consume the final image references.

use crate::error::{ConveyorError, ConveyorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// One stage of a reported image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub signature: String,
    pub reference: String,
    pub rebuilt: bool,
}

/// One reported image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReport {
    /// Reference of the last stage artifact
    pub final_stage: String,
    pub content_signature: String,
    /// Whether any stage was built by this run
    pub rebuilt: bool,
    pub stages: Vec<StageRecord>,
    /// External references published by this run
    pub tags: Vec<String>,
}

/// Summary of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub project: String,
    pub command: String,
    pub finished_at: Option<DateTime<Utc>>,
    pub images: BTreeMap<String, ImageReport>,
}

impl BuildReport {
    pub fn new(project: &str, command: &str) -> Self {
        Self {
            project: project.to_string(),
            command: command.to_string(),
            finished_at: None,
            images: BTreeMap::new(),
        }
    }

    /// Entry for `image`, created on first use
    pub fn image_mut(&mut self, image: &str) -> &mut ImageReport {
        self.images.entry(image.to_string()).or_default()
    }

    /// Record a published reference
    pub fn add_tag(&mut self, image: &str, reference: &str) {
        let entry = self.image_mut(image);
        if !entry.tags.iter().any(|t| t == reference) {
            entry.tags.push(reference.to_string());
        }
    }

    /// Write the report as pretty JSON, creating parent directories
    pub async fn write(&mut self, path: &Path) -> ConveyorResult<()> {
        self.finished_at = Some(Utc::now());
        let content = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConveyorError::io(format!("creating {}", parent.display()), e))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ConveyorError::io(format!("writing report to {}", path.display()), e))?;
        info!("Build report written to {}", path.display());
        Ok(())
    }
}
