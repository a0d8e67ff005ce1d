//! Stage artifact records
//!
//! An [`ImageInfo`] describes one stored image, whether it was inspected in
//! the local engine or read from a registry manifest. All build metadata
//! lives in image labels so any storage can answer selection queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Image label keys written by Conveyor
pub mod labels {
    /// Project that produced the artifact
    pub const PROJECT: &str = "io.conveyor.project";
    /// Conveyor version that produced the artifact
    pub const VERSION: &str = "io.conveyor.version";
    /// Cache format version
    pub const CACHE_VERSION: &str = "io.conveyor.cache-version";
    /// Stage signature
    pub const SIGNATURE: &str = "io.conveyor.signature";
    /// Stage name (from, install, ...)
    pub const STAGE: &str = "io.conveyor.stage";
    /// Engine ID of the image the stage was built on
    pub const PARENT_ID: &str = "io.conveyor.parent-id";
    /// Git commit the stage content was taken from
    pub const GIT_COMMIT: &str = "io.conveyor.git-commit";
    /// Marks a published (final) image
    pub const IMAGE: &str = "io.conveyor.image";
    /// Declared image name of a published image
    pub const IMAGE_NAME: &str = "io.conveyor.image-name";
    /// Tag strategy used to publish
    pub const TAG_STRATEGY: &str = "io.conveyor.tag-strategy";
    /// Signature of the last stage of a published image
    pub const CONTENT_SIGNATURE: &str = "io.conveyor.content-signature";
}

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Split `repo[:tag]` into repository and tag.
///
/// A colon only starts a tag when it comes after the last slash, so
/// `localhost:5000/app` has no tag.
pub fn split_reference(reference: &str) -> (&str, Option<&str>) {
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => {
            let at = name_start + i;
            (&reference[..at], Some(&reference[at + 1..]))
        }
        None => (reference, None),
    }
}

/// Strip the `sha256:` algorithm prefix engines and registries disagree on
pub fn normalize_id(id: &str) -> &str {
    id.strip_prefix("sha256:").unwrap_or(id)
}

/// A stored image and its metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Full reference (`repository:tag`)
    pub name: String,
    pub repository: String,
    pub tag: String,
    /// Engine image ID, without algorithm prefix
    pub id: String,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

impl ImageInfo {
    /// Create a record for `reference` with the given ID and labels
    pub fn new(reference: &str, id: &str, labels: HashMap<String, String>) -> Self {
        let (repository, tag) = split_reference(reference);
        let tag = tag.unwrap_or("latest");
        Self {
            name: format!("{}:{}", repository, tag),
            repository: repository.to_string(),
            tag: tag.to_string(),
            id: normalize_id(id).to_string(),
            labels,
            created_at: Utc::now(),
            size: 0,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn signature(&self) -> Option<&str> {
        self.label(labels::SIGNATURE)
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.label(labels::PARENT_ID)
    }

    pub fn git_commit(&self) -> Option<&str> {
        self.label(labels::GIT_COMMIT)
    }

    /// Same record under another reference (a tag of the same image)
    pub fn retagged(&self, reference: &str) -> Self {
        let mut info = Self::new(reference, &self.id, self.labels.clone());
        info.created_at = self.created_at;
        info.size = self.size;
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_reference_variants() {
        assert_eq!(split_reference("app:1.0"), ("app", Some("1.0")));
        assert_eq!(split_reference("app"), ("app", None));
        assert_eq!(
            split_reference("localhost:5000/team/app"),
            ("localhost:5000/team/app", None)
        );
        assert_eq!(
            split_reference("localhost:5000/team/app:image-stage-abc"),
            ("localhost:5000/team/app", Some("image-stage-abc"))
        );
    }

    #[test]
    fn new_defaults_tag_and_strips_id_prefix() {
        let info = ImageInfo::new("ubuntu", "sha256:deadbeef", HashMap::new());
        assert_eq!(info.name, "ubuntu:latest");
        assert_eq!(info.id, "deadbeef");
    }

    #[test]
    fn label_accessors() {
        let mut labels = HashMap::new();
        labels.insert(labels::SIGNATURE.to_string(), "abc".to_string());
        labels.insert(labels::PARENT_ID.to_string(), "p1".to_string());
        let info = ImageInfo::new("image-stage-demo:abc", "id1", labels);
        assert_eq!(info.signature(), Some("abc"));
        assert_eq!(info.parent_id(), Some("p1"));
        assert_eq!(info.git_commit(), None);
    }

    #[test]
    fn retagged_keeps_identity() {
        let info = ImageInfo::new("a:1", "id1", HashMap::new()).with_size(10);
        let tagged = info.retagged("registry.local/app:v1");
        assert_eq!(tagged.id, "id1");
        assert_eq!(tagged.repository, "registry.local/app");
        assert_eq!(tagged.tag, "v1");
        assert_eq!(tagged.size, 10);
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.0 GB");
    }
}
