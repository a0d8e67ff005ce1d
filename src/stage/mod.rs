//! Stages: the units an image is built from
//!
//! Each stage turns the artifact of the stage before it into a new artifact.
//! A stage answers four questions for the pipeline: is it a no-op, what is
//! its dependency digest, which stored artifact may be reused for it, and
//! how to build it when none can.

mod spec;

pub use spec::{
    BaseImage, DockerInstructions, GitMapping, InstructionKind, LifecycleSlot, StageName,
    StageSpec,
};

use crate::engine::{BuildRequest, ContainerEngine, Instruction};
use crate::error::{ConveyorError, ConveyorResult};
use crate::git::{GitRepo, PathFilter};
use crate::signature::{content_digest, Signature};
use crate::storage::{labels, normalize_id, ArtifactHandle, ImageInfo};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Directory inside build containers for files conveyor adds
pub const SERVICE_DIR: &str = "/.conveyor";

/// Collaborators and chain state a stage is evaluated against
#[derive(Clone, Copy)]
pub struct StageEnv<'a> {
    pub project: &'a str,
    pub cache_version: &'a str,
    pub engine: &'a dyn ContainerEngine,
    pub git: Option<&'a dyn GitRepo>,
    /// Artifact of the previous stage, once known
    pub previous: Option<&'a ImageInfo>,
    /// Commit the image's git content currently comes from
    pub git_commit: Option<&'a str>,
    /// Final signature of the image a `from_image` base names
    pub base_image_signature: Option<&'a Signature>,
}

impl<'a> StageEnv<'a> {
    fn git(&self, stage: StageName) -> ConveyorResult<&'a dyn GitRepo> {
        self.git
            .ok_or_else(|| ConveyorError::GitRepoMissing(stage.to_string()))
    }
}

/// Interactive shells opened when a build fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntrospectOptions {
    /// Shell in the stage's base image
    pub before_error: bool,
    /// Shell in the base image with the stage's commands replayed
    pub after_error: bool,
}

/// Inputs assembled before building, on top of the stage's own instructions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildInputs {
    pub labels: HashMap<String, String>,
    pub volumes: Vec<String>,
    pub run_env: HashMap<String, String>,
}

/// One stage of an image and what the pipeline learned about it
#[derive(Debug, Clone)]
pub struct Stage {
    pub spec: StageSpec,
    pub digest: Option<String>,
    /// Assigned once per run by the signatures phase
    pub signature: Option<Signature>,
    /// Stored artifact bound to the signature
    pub artifact: Option<ImageInfo>,
    pub inputs: Option<BuildInputs>,
    /// Built by this run rather than reused
    pub rebuilt: bool,
}

impl Stage {
    pub fn new(spec: StageSpec) -> Self {
        Self {
            spec,
            digest: None,
            signature: None,
            artifact: None,
            inputs: None,
            rebuilt: false,
        }
    }

    pub fn name(&self) -> StageName {
        self.spec.name()
    }

    /// Whether the stage would leave its base unchanged
    pub async fn is_empty(&self, env: &StageEnv<'_>) -> ConveyorResult<bool> {
        match &self.spec {
            StageSpec::From { .. } => Ok(false),
            StageSpec::GitArchive(mappings) => Ok(mappings.is_empty()),
            StageSpec::Instructions { commands, .. } => Ok(commands.is_empty()),
            StageSpec::DockerInstructions(docker) => Ok(docker.is_empty()),
            StageSpec::GitLatestPatch(mappings) => {
                if mappings.is_empty() {
                    return Ok(true);
                }
                let Some(from) = env.git_commit else {
                    return Ok(true);
                };
                let git = env.git(self.name())?;
                let head = git.latest_commit().await?;
                if from == head {
                    return Ok(true);
                }
                for mapping in mappings {
                    if git.is_any_changes(&mapping.filter(), from, &head).await? {
                        return Ok(false);
                    }
                }
                debug!("No changes between {} and {}", from, head);
                Ok(true)
            }
        }
    }

    /// Deterministic digest of everything the stage's content depends on
    pub async fn dependency_digest(&self, env: &StageEnv<'_>) -> ConveyorResult<String> {
        match &self.spec {
            StageSpec::From {
                base: BaseImage::Reference(reference),
                from_latest,
                cache_version,
            } => {
                if !from_latest && cache_version.is_none() {
                    return Ok(reference.clone());
                }
                let mut parts = vec!["from".to_string(), reference.clone()];
                if let Some(version) = cache_version {
                    parts.push(version.clone());
                }
                if *from_latest {
                    env.engine.pull(reference).await?;
                    let base = env
                        .engine
                        .inspect(reference)
                        .await?
                        .ok_or_else(|| ConveyorError::ImageMissing(reference.clone()))?;
                    parts.push(base.id);
                }
                Ok(content_digest(parts))
            }
            StageSpec::From {
                base: BaseImage::Image(name),
                cache_version,
                ..
            } => {
                let signature = env.base_image_signature.ok_or_else(|| {
                    ConveyorError::Internal(format!("image {} has no signature yet", name))
                })?;
                let mut parts = vec!["from-image", name.as_str(), signature.as_str()];
                if let Some(version) = cache_version {
                    parts.push(version);
                }
                Ok(content_digest(parts))
            }
            StageSpec::GitArchive(mappings) => {
                env.git(self.name())?;
                let mut parts = vec!["git-archive".to_string()];
                for mapping in mappings {
                    parts.extend(mapping.digest_parts());
                }
                Ok(content_digest(parts))
            }
            StageSpec::Instructions {
                kind,
                commands,
                dependencies,
                ..
            } => {
                if *kind == InstructionKind::Shell && dependencies.is_empty() {
                    return Ok(commands.join("\n"));
                }
                let mut parts = vec![kind.as_str().to_string()];
                parts.extend(commands.iter().cloned());
                if !dependencies.is_empty() {
                    let git = env.git(self.name())?;
                    let head = git.latest_commit().await?;
                    let filter = PathFilter::new("/").with_includes(dependencies.clone());
                    let content = git.diff(&filter, None, &head).await?;
                    parts.push(content_digest([content]));
                }
                Ok(content_digest(parts))
            }
            StageSpec::GitLatestPatch(mappings) => {
                let git = env.git(self.name())?;
                let from = env.git_commit.ok_or_else(|| {
                    ConveyorError::Internal("git patch stage without a base commit".to_string())
                })?;
                let head = git.latest_commit().await?;
                let mut parts = vec!["git-patch".to_string()];
                for mapping in mappings {
                    parts.push(git.diff(&mapping.filter(), Some(from), &head).await?);
                }
                Ok(content_digest(parts))
            }
            StageSpec::DockerInstructions(docker) => {
                Ok(content_digest([serde_json::to_string(docker)?]))
            }
        }
    }

    /// Pick the stored artifact to reuse for this stage's signature.
    ///
    /// Candidates are tried oldest first; one that fails any check is
    /// skipped, and no usable candidate means the stage must be built.
    pub async fn select_cache_artifact(
        &self,
        env: &StageEnv<'_>,
        candidates: &[ImageInfo],
    ) -> ConveyorResult<Option<ImageInfo>> {
        let Some(signature) = &self.signature else {
            return Ok(None);
        };

        let mut ordered: Vec<&ImageInfo> = candidates.iter().collect();
        ordered.sort_by_key(|c| c.created_at);

        for candidate in ordered {
            if let Some(reason) = self.reject_reason(env, signature, candidate) {
                debug!("Skipping {}: {}", candidate.name, reason);
                continue;
            }
            if self.accepts(env, candidate).await? {
                return Ok(Some(candidate.clone()));
            }
        }
        Ok(None)
    }

    fn reject_reason(
        &self,
        env: &StageEnv<'_>,
        signature: &Signature,
        candidate: &ImageInfo,
    ) -> Option<String> {
        if candidate.label(labels::PROJECT) != Some(env.project) {
            return Some("built by another project".to_string());
        }
        if candidate.label(labels::CACHE_VERSION) != Some(env.cache_version) {
            return Some(format!(
                "cache version {} != {}",
                candidate.label(labels::CACHE_VERSION).unwrap_or("none"),
                env.cache_version
            ));
        }
        if candidate.signature() != Some(signature.as_str()) {
            return Some("signature label mismatch".to_string());
        }
        if let Some(previous) = env.previous {
            let parent = candidate.parent_id().map(normalize_id);
            if parent != Some(normalize_id(&previous.id)) {
                return Some(format!("built on {}", parent.unwrap_or("unknown parent")));
            }
        }
        None
    }

    async fn accepts(&self, env: &StageEnv<'_>, candidate: &ImageInfo) -> ConveyorResult<bool> {
        match &self.spec {
            StageSpec::GitArchive(_) => {
                let Some(commit) = candidate.git_commit() else {
                    return Ok(false);
                };
                let git = env.git(self.name())?;
                let head = git.latest_commit().await?;
                git.is_ancestor(commit, &head).await
            }
            _ => Ok(true),
        }
    }

    /// Labels every artifact of this stage carries
    pub fn service_labels(&self, project: &str, cache_version: &str) -> HashMap<String, String> {
        let mut out = HashMap::from([
            (labels::PROJECT.to_string(), project.to_string()),
            (labels::VERSION.to_string(), env!("CARGO_PKG_VERSION").to_string()),
            (labels::CACHE_VERSION.to_string(), cache_version.to_string()),
            (labels::STAGE.to_string(), self.name().to_string()),
        ]);
        if let Some(signature) = &self.signature {
            out.insert(labels::SIGNATURE.to_string(), signature.to_string());
        }
        out
    }

    async fn instructions(
        &self,
        env: &StageEnv<'_>,
    ) -> ConveyorResult<(Vec<Instruction>, HashMap<String, String>)> {
        let mut extra_labels = HashMap::new();
        let instructions = match &self.spec {
            StageSpec::From { .. } => Vec::new(),
            StageSpec::GitArchive(mappings) => {
                let git = env.git(self.name())?;
                let commit = git.latest_commit().await?;
                let mut out = Vec::new();
                for mapping in mappings {
                    let archive = git.archive(&mapping.filter(), &commit).await?;
                    out.push(Instruction::AddArchive {
                        archive,
                        to: mapping.to.clone(),
                    });
                }
                extra_labels.insert(labels::GIT_COMMIT.to_string(), commit);
                out
            }
            StageSpec::Instructions {
                slot,
                kind: InstructionKind::Shell,
                commands,
                ..
            } => {
                debug!("Running {} shell commands for {:?}", commands.len(), slot);
                vec![Instruction::Run(commands.clone())]
            }
            StageSpec::Instructions {
                kind: InstructionKind::Ansible,
                commands,
                ..
            } => {
                let playbook = format!("{}/ansible/{}.json", SERVICE_DIR, self.name());
                vec![
                    Instruction::AddFile {
                        content: spec::ansible_playbook(commands).into_bytes(),
                        to: playbook.clone(),
                    },
                    Instruction::Run(vec![format!(
                        "ansible-playbook -c local -i localhost, {}",
                        playbook
                    )]),
                ]
            }
            StageSpec::GitLatestPatch(mappings) => {
                let git = env.git(self.name())?;
                let from = env.git_commit.ok_or_else(|| {
                    ConveyorError::Internal("git patch stage without a base commit".to_string())
                })?;
                let head = git.latest_commit().await?;
                let mut out = Vec::new();
                for mapping in mappings {
                    let patch = git.diff(&mapping.filter(), Some(from), &head).await?;
                    if patch.is_empty() {
                        continue;
                    }
                    out.push(Instruction::ApplyPatch {
                        patch: patch.into_bytes(),
                        to: mapping.to.clone(),
                    });
                }
                extra_labels.insert(labels::GIT_COMMIT.to_string(), head);
                out
            }
            StageSpec::DockerInstructions(docker) => {
                extra_labels.extend(docker.label.clone());
                docker.instructions()
            }
        };
        Ok((instructions, extra_labels))
    }

    /// Build the stage on top of `base_reference`.
    ///
    /// The result is left under a temporary tag for the storage to publish.
    pub async fn build(
        &self,
        env: &StageEnv<'_>,
        base_reference: &str,
        introspect: IntrospectOptions,
    ) -> ConveyorResult<ArtifactHandle> {
        let signature = self.signature.clone().ok_or_else(|| {
            ConveyorError::Internal(format!("stage {} built before signing", self.name()))
        })?;

        let tag = format!(
            "conveyor-build-{}-{}",
            signature.short(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let (instructions, extra_labels) = self.instructions(env).await?;

        let mut request = BuildRequest::new(base_reference, tag.clone());
        request.instructions = instructions;
        match &self.inputs {
            Some(inputs) => {
                request.labels = inputs.labels.clone();
                request.volumes = inputs.volumes.clone();
                request.run_env = inputs.run_env.clone();
            }
            None => request.labels = self.service_labels(env.project, env.cache_version),
        }
        if let Some(previous) = env.previous {
            request
                .labels
                .insert(labels::PARENT_ID.to_string(), previous.id.clone());
        }
        request.labels.extend(extra_labels);

        debug!("Building stage {} ({}) on {}", self.name(), signature.short(), base_reference);
        match env.engine.build(&request).await {
            Ok(id) => Ok(ArtifactHandle {
                project: env.project.to_string(),
                signature,
                id,
                build_tag: tag,
            }),
            Err(e) => {
                if introspect.before_error {
                    if let Err(ie) = env.engine.introspect(base_reference, &[]).await {
                        warn!("Introspection failed: {}", ie);
                    }
                }
                if introspect.after_error {
                    if let Err(ie) = env
                        .engine
                        .introspect(base_reference, &request.run_commands())
                        .await
                    {
                        warn!("Introspection failed: {}", ie);
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeEngine, FakeGitRepo};
    use crate::signature::sign;
    use chrono::{Duration, Utc};

    fn env<'a>(engine: &'a FakeEngine, git: Option<&'a FakeGitRepo>) -> StageEnv<'a> {
        StageEnv {
            project: "demo",
            cache_version: "7",
            engine,
            git: git.map(|g| g as &dyn GitRepo),
            previous: None,
            git_commit: None,
            base_image_signature: None,
        }
    }

    fn shell(slot: LifecycleSlot, commands: &[&str]) -> Stage {
        Stage::new(StageSpec::Instructions {
            slot,
            kind: InstructionKind::Shell,
            commands: commands.iter().map(|c| c.to_string()).collect(),
            dependencies: vec![],
        })
    }

    fn candidate(sig: &Signature, parent: Option<&str>, age_secs: i64) -> ImageInfo {
        let mut labels = HashMap::from([
            (labels::PROJECT.to_string(), "demo".to_string()),
            (labels::CACHE_VERSION.to_string(), "7".to_string()),
            (labels::SIGNATURE.to_string(), sig.to_string()),
        ]);
        if let Some(parent) = parent {
            labels.insert(labels::PARENT_ID.to_string(), parent.to_string());
        }
        ImageInfo::new(&format!("image-stage-demo:{}", sig), &format!("id-{}", age_secs), labels)
            .with_created_at(Utc::now() - Duration::seconds(age_secs))
    }

    #[tokio::test]
    async fn plain_base_digest_is_the_reference() {
        let engine = FakeEngine::new();
        let stage = Stage::new(StageSpec::From {
            base: BaseImage::Reference("base:ubuntu".to_string()),
            from_latest: false,
            cache_version: None,
        });
        let env = env(&engine, None);
        assert!(!stage.is_empty(&env).await.unwrap());
        assert_eq!(stage.dependency_digest(&env).await.unwrap(), "base:ubuntu");
    }

    #[tokio::test]
    async fn shell_digest_is_command_text() {
        let engine = FakeEngine::new();
        let env = env(&engine, None);
        let stage = shell(LifecycleSlot::Install, &["apt install curl"]);
        assert_eq!(stage.dependency_digest(&env).await.unwrap(), "apt install curl");
        assert!(shell(LifecycleSlot::Setup, &[]).is_empty(&env).await.unwrap());
    }

    #[tokio::test]
    async fn dependency_paths_require_git() {
        let engine = FakeEngine::new();
        let stage = Stage::new(StageSpec::Instructions {
            slot: LifecycleSlot::Install,
            kind: InstructionKind::Shell,
            commands: vec!["make".to_string()],
            dependencies: vec!["Makefile".to_string()],
        });
        assert!(matches!(
            stage.dependency_digest(&env(&engine, None)).await,
            Err(ConveyorError::GitRepoMissing(_))
        ));

        let git = FakeGitRepo::new("c1");
        let first = stage.dependency_digest(&env(&engine, Some(&git))).await.unwrap();
        git.commit("c2");
        let second = stage.dependency_digest(&env(&engine, Some(&git))).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn git_patch_empty_without_changes() {
        let engine = FakeEngine::new();
        let git = FakeGitRepo::new("c1");
        let stage = Stage::new(StageSpec::GitLatestPatch(vec![GitMapping::default()]));

        let mut env = env(&engine, Some(&git));
        assert!(stage.is_empty(&env).await.unwrap());
        env.git_commit = Some("c1");
        assert!(stage.is_empty(&env).await.unwrap());

        git.commit("c2");
        assert!(!stage.is_empty(&env).await.unwrap());
        assert!(!stage.dependency_digest(&env).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn select_prefers_oldest_valid_candidate() {
        let engine = FakeEngine::new();
        let mut stage = shell(LifecycleSlot::Install, &["make"]);
        let sig = sign("make", "prev", "7");
        stage.signature = Some(sig.clone());

        let previous = ImageInfo::new("image-stage-demo:prev", "parent-1", HashMap::new());
        let mut env = env(&engine, None);
        env.previous = Some(&previous);

        let candidates = vec![
            candidate(&sig, Some("parent-1"), 10),
            candidate(&sig, Some("parent-1"), 100),
            candidate(&sig, Some("other"), 1000),
        ];
        let chosen = stage.select_cache_artifact(&env, &candidates).await.unwrap();
        assert_eq!(chosen.map(|c| c.id), Some("id-100".to_string()));
    }

    #[tokio::test]
    async fn select_rejects_foreign_and_stale_artifacts() {
        let engine = FakeEngine::new();
        let mut stage = shell(LifecycleSlot::Install, &["make"]);
        let sig = sign("make", "", "7");
        stage.signature = Some(sig.clone());
        let env = env(&engine, None);

        let mut foreign = candidate(&sig, None, 1);
        foreign
            .labels
            .insert(labels::PROJECT.to_string(), "other".to_string());
        let mut stale = candidate(&sig, None, 2);
        stale
            .labels
            .insert(labels::CACHE_VERSION.to_string(), "6".to_string());

        let chosen = stage
            .select_cache_artifact(&env, &[foreign, stale])
            .await
            .unwrap();
        assert!(chosen.is_none());
    }

    #[tokio::test]
    async fn archive_candidate_must_be_ancestor_of_head() {
        let engine = FakeEngine::new();
        let git = FakeGitRepo::new("c1");
        git.commit("c2");
        let mut stage = Stage::new(StageSpec::GitArchive(vec![GitMapping::default()]));
        let sig = sign("archive", "", "7");
        stage.signature = Some(sig.clone());
        let env = env(&engine, Some(&git));

        let mut unrelated = candidate(&sig, None, 5);
        unrelated
            .labels
            .insert(labels::GIT_COMMIT.to_string(), "elsewhere".to_string());
        let mut ancestor = candidate(&sig, None, 1);
        ancestor
            .labels
            .insert(labels::GIT_COMMIT.to_string(), "c1".to_string());

        let chosen = stage
            .select_cache_artifact(&env, &[unrelated, ancestor.clone()])
            .await
            .unwrap();
        assert_eq!(chosen, Some(ancestor));
    }

    #[tokio::test]
    async fn build_labels_and_introspection() {
        let engine = FakeEngine::new();
        let base = engine.add_image("image-stage-demo:base", HashMap::new());
        let mut stage = shell(LifecycleSlot::Install, &["make", "make install"]);
        stage.signature = Some(sign("make", "", "7"));

        let mut env = env(&engine, None);
        env.previous = Some(&base);
        let handle = stage
            .build(&env, &base.name, IntrospectOptions::default())
            .await
            .unwrap();
        let built = engine.inspect(&handle.build_tag).await.unwrap().unwrap();
        assert_eq!(built.parent_id(), Some(base.id.as_str()));
        assert_eq!(built.label(labels::STAGE), Some("install"));
        assert_eq!(built.label(labels::CACHE_VERSION), Some("7"));

        engine.fail_builds_containing("make install");
        let introspect = IntrospectOptions {
            before_error: true,
            after_error: true,
        };
        assert!(stage.build(&env, &base.name, introspect).await.is_err());
        let sessions = engine.introspections();
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].1.is_empty());
        assert_eq!(sessions[1].1, vec!["make", "make install"]);
    }
}
