//! Git repository backed by the `git` CLI

use super::{GitRepo, PathFilter, EMPTY_TREE};
use crate::error::{ConveyorError, ConveyorResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

/// A working tree on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalGitRepo {
    root: PathBuf,
}

impl LocalGitRepo {
    /// Open the repository at `root` without checking it
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Find the repository containing `dir`, if any
    pub async fn discover(dir: &Path) -> ConveyorResult<Option<Self>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["rev-parse", "--show-toplevel"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ConveyorError::command_failed("git rev-parse", e))?;
        if !output.status.success() {
            debug!("{} is not inside a git repository", dir.display());
            return Ok(None);
        }
        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Some(Self::new(root)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Execute a git command and return the raw output
    async fn exec(&self, args: &[&str]) -> ConveyorResult<Output> {
        debug!("Executing: git {:?}", args);
        Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ConveyorError::command_failed(format!("git {:?}", args), e))
    }

    /// Execute a git command that must succeed
    async fn run(&self, args: &[&str]) -> ConveyorResult<Vec<u8>> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(ConveyorError::Git {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn run_text(&self, args: &[&str]) -> ConveyorResult<String> {
        let stdout = self.run(args).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    /// Run a command whose exit status is the answer (0 yes, 1 no)
    async fn run_predicate(&self, args: &[&str]) -> ConveyorResult<bool> {
        let output = self.exec(args).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(ConveyorError::Git {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}

#[async_trait]
impl GitRepo for LocalGitRepo {
    async fn diff(&self, filter: &PathFilter, from: Option<&str>, to: &str) -> ConveyorResult<String> {
        let relative = format!("--relative={}", filter.base);
        let specs = filter.pathspecs();
        let mut args = vec!["diff", "--binary", "--full-index", "--no-color"];
        if !filter.base.is_empty() {
            args.push(&relative);
        }
        args.push(from.unwrap_or(EMPTY_TREE));
        args.push(to);
        args.push("--");
        args.extend(specs.iter().map(String::as_str));
        let stdout = self.run(&args).await?;
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    async fn is_any_changes(&self, filter: &PathFilter, from: &str, to: &str) -> ConveyorResult<bool> {
        let specs = filter.pathspecs();
        let mut args = vec!["diff", "--quiet", from, to, "--"];
        args.extend(specs.iter().map(String::as_str));
        // `diff --quiet` exits 1 when there are changes
        self.run_predicate(&args).await.map(|same| !same)
    }

    async fn archive(&self, filter: &PathFilter, commit: &str) -> ConveyorResult<Vec<u8>> {
        let tree = if filter.base.is_empty() {
            commit.to_string()
        } else {
            format!("{}:{}", commit, filter.base)
        };
        // Pathspecs are relative to the archived tree
        let relative = PathFilter {
            base: String::new(),
            ..filter.clone()
        };
        let specs = relative.pathspecs();
        let mut args = vec!["archive", "--format=tar", tree.as_str(), "--"];
        args.extend(specs.iter().map(String::as_str));
        self.run(&args).await
    }

    async fn latest_commit(&self) -> ConveyorResult<String> {
        self.run_text(&["rev-parse", "HEAD"]).await
    }

    async fn latest_branch_commit(&self, branch: &str) -> ConveyorResult<String> {
        let rev = format!("{}^{{commit}}", branch);
        self.run_text(&["rev-parse", &rev]).await
    }

    async fn latest_tag_commit(&self, tag: &str) -> ConveyorResult<String> {
        let rev = format!("refs/tags/{}^{{commit}}", tag);
        self.run_text(&["rev-parse", &rev]).await
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> ConveyorResult<bool> {
        self.run_predicate(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await
    }

    async fn current_branch(&self) -> ConveyorResult<Option<String>> {
        let output = self.exec(&["symbolic-ref", "--short", "-q", "HEAD"]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!branch.is_empty()).then_some(branch))
    }

    async fn head_tag(&self) -> ConveyorResult<Option<String>> {
        let tags = self.run_text(&["tag", "--points-at", "HEAD"]).await?;
        let mut tags: Vec<&str> = tags.lines().filter(|t| !t.is_empty()).collect();
        tags.sort_unstable();
        Ok(tags.first().map(|t| t.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .output()
            .unwrap();
        assert!(status.status.success(), "git {:?} failed", args);
    }

    fn init_repo() -> TempDir {
        let temp = TempDir::new().unwrap();
        git(temp.path(), &["init", "-q", "-b", "main"]);
        std::fs::create_dir_all(temp.path().join("app")).unwrap();
        std::fs::write(temp.path().join("app/main.txt"), "one\n").unwrap();
        std::fs::write(temp.path().join("README"), "readme\n").unwrap();
        git(temp.path(), &["add", "."]);
        git(temp.path(), &["commit", "-q", "-m", "first"]);
        temp
    }

    #[tokio::test]
    async fn discover_outside_repo() {
        if !git_available() {
            return;
        }
        let temp = TempDir::new().unwrap();
        assert!(LocalGitRepo::discover(temp.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commits_diffs_and_ancestry() {
        if !git_available() {
            return;
        }
        let temp = init_repo();
        let repo = LocalGitRepo::discover(temp.path()).await.unwrap().unwrap();
        let first = repo.latest_commit().await.unwrap();
        assert_eq!(repo.current_branch().await.unwrap().as_deref(), Some("main"));

        std::fs::write(temp.path().join("app/main.txt"), "two\n").unwrap();
        git(temp.path(), &["commit", "-q", "-am", "second"]);
        let second = repo.latest_commit().await.unwrap();
        assert_ne!(first, second);

        let app = PathFilter::new("/app");
        assert!(repo.is_any_changes(&app, &first, &second).await.unwrap());
        let readme_only = PathFilter::new("/").with_includes(vec!["README".to_string()]);
        assert!(!repo.is_any_changes(&readme_only, &first, &second).await.unwrap());

        let patch = repo.diff(&app, Some(&first), &second).await.unwrap();
        assert!(patch.contains("a/main.txt"));
        assert!(patch.contains("+two"));

        assert!(repo.is_ancestor(&first, &second).await.unwrap());
        assert!(!repo.is_ancestor(&second, &first).await.unwrap());

        let archive = repo.archive(&app, &second).await.unwrap();
        assert!(!archive.is_empty());
    }

    #[tokio::test]
    async fn head_tag_lookup() {
        if !git_available() {
            return;
        }
        let temp = init_repo();
        let repo = LocalGitRepo::new(temp.path());
        assert_eq!(repo.head_tag().await.unwrap(), None);
        git(temp.path(), &["tag", "v1.0"]);
        assert_eq!(repo.head_tag().await.unwrap().as_deref(), Some("v1.0"));
        assert_eq!(
            repo.latest_tag_commit("v1.0").await.unwrap(),
            repo.latest_commit().await.unwrap()
        );
    }
}
