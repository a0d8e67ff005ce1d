//! External tags for published images

use crate::error::{ConveyorError, ConveyorResult};
use crate::git::GitRepo;
use crate::signature::Signature;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Longest tag a registry accepts
const MAX_TAG_LEN: usize = 128;

/// Where a tag value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagStrategy {
    Custom,
    GitBranch,
    GitTag,
    GitCommit,
    Ci,
    StagesSignature,
}

impl TagStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Custom => "custom",
            Self::GitBranch => "git-branch",
            Self::GitTag => "git-tag",
            Self::GitCommit => "git-commit",
            Self::Ci => "ci",
            Self::StagesSignature => "stages-signature",
        }
    }
}

impl fmt::Display for TagStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `[tagging]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggingOptions {
    pub custom: Vec<String>,
    pub git_branch: bool,
    pub git_tag: bool,
    pub git_commit: bool,
    /// Environment variable holding a CI-provided tag
    pub ci_env: Option<String>,
    /// Tag with the image's content signature
    pub stages_signature: bool,
}

/// A tag to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSpec {
    pub strategy: TagStrategy,
    pub value: String,
}

/// Turn an arbitrary string into a valid image tag.
///
/// Invalid characters become `-`; overlong values are cut and suffixed
/// with a hash of the original so distinct inputs stay distinct.
pub fn slugify_tag(value: &str) -> String {
    let mut slug: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    while slug.starts_with(|c: char| c == '.' || c == '-') {
        slug.remove(0);
    }
    if slug.is_empty() {
        slug.push('_');
    }
    if slug.len() > MAX_TAG_LEN {
        let hash = crate::signature::content_digest([value]);
        slug.truncate(MAX_TAG_LEN - 9);
        slug.push('-');
        slug.push_str(&hash[..8]);
    }
    slug
}

/// Resolve every configured strategy into tags, in a stable order.
///
/// Git strategies that have nothing to offer (detached HEAD, untagged
/// commit) are skipped.
pub async fn resolve_tags(
    options: &TaggingOptions,
    git: Option<&dyn GitRepo>,
    content_signature: &Signature,
) -> ConveyorResult<Vec<TagSpec>> {
    let mut tags: Vec<TagSpec> = Vec::new();
    let mut push = |strategy: TagStrategy, value: &str| {
        let value = slugify_tag(value);
        if !tags.iter().any(|t| t.value == value) {
            tags.push(TagSpec { strategy, value });
        }
    };

    for custom in &options.custom {
        push(TagStrategy::Custom, custom);
    }
    let wants_git = options.git_branch || options.git_tag || options.git_commit;
    if let (None, true) = (git, wants_git) {
        return Err(ConveyorError::User(
            "git tagging is enabled, but no git repository was found".to_string(),
        ));
    }
    if let Some(git) = git {
        if options.git_branch {
            match git.current_branch().await? {
                Some(branch) => push(TagStrategy::GitBranch, &branch),
                None => debug!("Detached HEAD, no branch tag"),
            }
        }
        if options.git_tag {
            if let Some(tag) = git.head_tag().await? {
                push(TagStrategy::GitTag, &tag);
            }
        }
        if options.git_commit {
            push(TagStrategy::GitCommit, &git.latest_commit().await?);
        }
    }
    if let Some(var) = &options.ci_env {
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => push(TagStrategy::Ci, &value),
            _ => debug!("{} is not set, no CI tag", var),
        }
    }
    if options.stages_signature {
        push(TagStrategy::StagesSignature, content_signature.as_str());
    }
    Ok(tags)
}
