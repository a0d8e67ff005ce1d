//! Stage variants and their declared inputs

use crate::engine::Instruction;
use crate::git::PathFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stage names, in chain order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageName {
    From,
    BeforeInstall,
    GitArchive,
    Install,
    BeforeSetup,
    Setup,
    GitLatestPatch,
    DockerInstructions,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::From => "from",
            Self::BeforeInstall => "beforeInstall",
            Self::GitArchive => "gitArchive",
            Self::Install => "install",
            Self::BeforeSetup => "beforeSetup",
            Self::Setup => "setup",
            Self::GitLatestPatch => "gitLatestPatch",
            Self::DockerInstructions => "dockerInstructions",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where user instructions run in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleSlot {
    BeforeInstall,
    Install,
    BeforeSetup,
    Setup,
}

impl LifecycleSlot {
    pub fn stage_name(&self) -> StageName {
        match self {
            Self::BeforeInstall => StageName::BeforeInstall,
            Self::Install => StageName::Install,
            Self::BeforeSetup => StageName::BeforeSetup,
            Self::Setup => StageName::Setup,
        }
    }
}

/// How user instructions are executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionKind {
    #[default]
    Shell,
    Ansible,
}

impl InstructionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Ansible => "ansible",
        }
    }
}

/// A repository subtree placed into the image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitMapping {
    /// Repository path to take (`/` for the whole tree)
    pub add: String,
    /// Destination inside the image
    pub to: String,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

impl GitMapping {
    pub fn filter(&self) -> PathFilter {
        PathFilter::new(&self.add)
            .with_includes(self.include_paths.clone())
            .with_excludes(self.exclude_paths.clone())
    }

    pub(crate) fn digest_parts(&self) -> [String; 4] {
        [
            self.add.clone(),
            self.to.clone(),
            self.include_paths.join("\0"),
            self.exclude_paths.join("\0"),
        ]
    }
}

/// Image metadata instructions applied last
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerInstructions {
    pub volume: Vec<String>,
    pub expose: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub label: BTreeMap<String, String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
}

impl DockerInstructions {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Engine instructions, labels excluded
    pub fn instructions(&self) -> Vec<Instruction> {
        let mut out = Vec::new();
        out.extend(self.volume.iter().cloned().map(Instruction::Volume));
        out.extend(self.expose.iter().cloned().map(Instruction::Expose));
        out.extend(
            self.env
                .iter()
                .map(|(k, v)| Instruction::Env(k.clone(), v.clone())),
        );
        if let Some(workdir) = &self.workdir {
            out.push(Instruction::Workdir(workdir.clone()));
        }
        if let Some(user) = &self.user {
            out.push(Instruction::User(user.clone()));
        }
        if !self.cmd.is_empty() {
            out.push(Instruction::Cmd(self.cmd.clone()));
        }
        if !self.entrypoint.is_empty() {
            out.push(Instruction::Entrypoint(self.entrypoint.clone()));
        }
        out
    }
}

/// Base of an image's `from` stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseImage {
    /// External image reference
    Reference(String),
    /// Another declared image, by name
    Image(String),
}

/// What a stage does, one variant per stage kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSpec {
    From {
        base: BaseImage,
        from_latest: bool,
        cache_version: Option<String>,
    },
    GitArchive(Vec<GitMapping>),
    Instructions {
        slot: LifecycleSlot,
        kind: InstructionKind,
        commands: Vec<String>,
        /// Repository paths whose changes force a rebuild
        dependencies: Vec<String>,
    },
    GitLatestPatch(Vec<GitMapping>),
    DockerInstructions(DockerInstructions),
}

impl StageSpec {
    pub fn name(&self) -> StageName {
        match self {
            Self::From { .. } => StageName::From,
            Self::GitArchive(_) => StageName::GitArchive,
            Self::Instructions { slot, .. } => slot.stage_name(),
            Self::GitLatestPatch(_) => StageName::GitLatestPatch,
            Self::DockerInstructions(_) => StageName::DockerInstructions,
        }
    }

    /// Whether the stage reads the git repository
    pub fn uses_git(&self) -> bool {
        match self {
            Self::GitArchive(mappings) | Self::GitLatestPatch(mappings) => !mappings.is_empty(),
            Self::Instructions { dependencies, .. } => !dependencies.is_empty(),
            _ => false,
        }
    }
}

/// Playbook running each command as an ansible shell task.
///
/// JSON is valid YAML, so no YAML writer is needed.
pub(crate) fn ansible_playbook(commands: &[String]) -> String {
    let tasks: Vec<serde_json::Value> = commands
        .iter()
        .map(|c| serde_json::json!({ "shell": c }))
        .collect();
    serde_json::json!([{
        "hosts": "all",
        "gather_facts": false,
        "tasks": tasks,
    }])
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_maps_to_stage() {
        let spec = StageSpec::Instructions {
            slot: LifecycleSlot::BeforeSetup,
            kind: InstructionKind::Shell,
            commands: vec![],
            dependencies: vec![],
        };
        assert_eq!(spec.name(), StageName::BeforeSetup);
        assert_eq!(spec.name().to_string(), "beforeSetup");
        assert!(!spec.uses_git());
    }

    #[test]
    fn path_lists_keep_their_boundaries() {
        let joined = GitMapping {
            include_paths: vec!["a,b".to_string()],
            ..Default::default()
        };
        let split = GitMapping {
            include_paths: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        assert_ne!(joined.digest_parts(), split.digest_parts());
    }

    #[test]
    fn docker_instructions_order_is_stable() {
        let mut docker = DockerInstructions::default();
        assert!(docker.is_empty());
        docker.env.insert("B".to_string(), "2".to_string());
        docker.env.insert("A".to_string(), "1".to_string());
        docker.workdir = Some("/app".to_string());
        docker.label.insert("team".to_string(), "core".to_string());

        assert!(!docker.is_empty());
        assert_eq!(
            docker.instructions(),
            vec![
                Instruction::Env("A".to_string(), "1".to_string()),
                Instruction::Env("B".to_string(), "2".to_string()),
                Instruction::Workdir("/app".to_string()),
            ]
        );
    }

    #[test]
    fn playbook_is_valid_json() {
        let playbook = ansible_playbook(&["echo hi".to_string()]);
        let parsed: serde_json::Value = serde_json::from_str(&playbook).unwrap();
        assert_eq!(parsed[0]["tasks"][0]["shell"], "echo hi");
    }

    #[test]
    fn mapping_filter_uses_paths() {
        let mapping = GitMapping {
            add: "/src".to_string(),
            to: "/app".to_string(),
            include_paths: vec!["lib".to_string()],
            exclude_paths: vec![],
        };
        assert_eq!(mapping.filter().base, "src");
    }
}
