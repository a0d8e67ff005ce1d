//! Git repository access for git-sourced stages
//!
//! Stages only see the [`GitRepo`] trait. [`LocalGitRepo`] drives the `git`
//! CLI; tests use the in-memory fake.

mod local;

pub use local::LocalGitRepo;

use crate::error::ConveyorResult;
use async_trait::async_trait;

/// Hash of git's empty tree, the "from" side of a full diff
pub const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// A subtree of the repository, filtered by include and exclude globs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathFilter {
    /// Repository-relative directory; empty for the root
    pub base: String,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

impl PathFilter {
    pub fn new(base: &str) -> Self {
        Self {
            base: normalize_base(base),
            ..Default::default()
        }
    }

    pub fn with_includes(mut self, include_paths: Vec<String>) -> Self {
        self.include_paths = include_paths;
        self
    }

    pub fn with_excludes(mut self, exclude_paths: Vec<String>) -> Self {
        self.exclude_paths = exclude_paths;
        self
    }

    /// Git pathspecs selecting this filter, relative to the repository root
    pub fn pathspecs(&self) -> Vec<String> {
        let join = |p: &str| {
            let p = p.trim_start_matches('/');
            if self.base.is_empty() {
                p.to_string()
            } else {
                format!("{}/{}", self.base, p)
            }
        };
        let mut specs: Vec<String> = if self.include_paths.is_empty() {
            vec![if self.base.is_empty() {
                ".".to_string()
            } else {
                self.base.clone()
            }]
        } else {
            self.include_paths.iter().map(|p| join(p)).collect()
        };
        specs.extend(
            self.exclude_paths
                .iter()
                .map(|p| format!(":(exclude){}", join(p))),
        );
        specs
    }
}

/// Strip leading/trailing slashes; `/` means the repository root
fn normalize_base(base: &str) -> String {
    base.trim_matches('/').to_string()
}

/// Read access to a git repository
#[async_trait]
pub trait GitRepo: Send + Sync {
    /// Patch between two commits, limited to `filter`, with paths relative
    /// to `filter.base`. `from: None` diffs against the empty tree.
    async fn diff(&self, filter: &PathFilter, from: Option<&str>, to: &str) -> ConveyorResult<String>;

    /// Whether `filter` differs between two commits
    async fn is_any_changes(&self, filter: &PathFilter, from: &str, to: &str) -> ConveyorResult<bool>;

    /// Tar archive of `filter` at `commit`, rooted at `filter.base`
    async fn archive(&self, filter: &PathFilter, commit: &str) -> ConveyorResult<Vec<u8>>;

    /// Commit checked out in the working tree
    async fn latest_commit(&self) -> ConveyorResult<String>;

    async fn latest_branch_commit(&self, branch: &str) -> ConveyorResult<String>;

    async fn latest_tag_commit(&self, tag: &str) -> ConveyorResult<String>;

    /// Whether `ancestor` is reachable from `descendant`
    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> ConveyorResult<bool>;

    /// Current branch, `None` on a detached HEAD
    async fn current_branch(&self) -> ConveyorResult<Option<String>>;

    /// Tag pointing at HEAD, if any
    async fn head_tag(&self) -> ConveyorResult<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_filter_selects_everything() {
        assert_eq!(PathFilter::new("/").pathspecs(), vec!["."]);
    }

    #[test]
    fn includes_and_excludes_are_joined_to_base() {
        let filter = PathFilter::new("/app/")
            .with_includes(vec!["src".to_string(), "/Cargo.toml".to_string()])
            .with_excludes(vec!["src/tests".to_string()]);
        assert_eq!(
            filter.pathspecs(),
            vec!["app/src", "app/Cargo.toml", ":(exclude)app/src/tests"]
        );
    }

    #[test]
    fn base_without_includes() {
        let filter = PathFilter::new("app").with_excludes(vec!["docs".to_string()]);
        assert_eq!(filter.pathspecs(), vec!["app", ":(exclude)app/docs"]);
    }
}
