//! Container registry access
//!
//! The build pipeline talks to registries only through the [`Registry`]
//! trait. Vendor quirks (which APIs exist, how deletion works) stay inside
//! the implementations.

mod docker;

pub use docker::{DockerRegistry, RegistryCredentials};

use crate::engine::ContainerEngine;
use crate::error::ConveyorResult;
use crate::storage::ImageInfo;
use async_trait::async_trait;
use std::fmt;

/// Host used for references without an explicit registry
pub const DOCKER_HUB_HOST: &str = "registry-1.docker.io";

/// Registry implementations with behavior differences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryVendor {
    DockerHub,
    GitHubPackages,
    GitLab,
    Quay,
    Ecr,
    Gcr,
    Acr,
    Harbor,
    Generic,
}

impl RegistryVendor {
    /// Detect the vendor from a repository address
    pub fn detect(address: &str) -> Self {
        let host = RepositoryAddress::parse(address).host;
        let host = host.as_str();
        if host == DOCKER_HUB_HOST || host == "docker.io" || host == "index.docker.io" {
            Self::DockerHub
        } else if host == "ghcr.io" || host == "docker.pkg.github.com" {
            Self::GitHubPackages
        } else if host.contains(".dkr.ecr.") && host.ends_with(".amazonaws.com") {
            Self::Ecr
        } else if host == "gcr.io" || host.ends_with(".gcr.io") || host.ends_with("-docker.pkg.dev") {
            Self::Gcr
        } else if host.ends_with(".azurecr.io") {
            Self::Acr
        } else if host == "quay.io" {
            Self::Quay
        } else if host.contains("gitlab") {
            Self::GitLab
        } else if host.contains("harbor") {
            Self::Harbor
        } else {
            Self::Generic
        }
    }

    /// Whether manifests can be deleted through the Docker Registry v2 API
    pub fn supports_delete(&self) -> bool {
        !matches!(self, Self::DockerHub | Self::GitHubPackages)
    }
}

impl fmt::Display for RegistryVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DockerHub => "dockerhub",
            Self::GitHubPackages => "github",
            Self::GitLab => "gitlab",
            Self::Quay => "quay",
            Self::Ecr => "ecr",
            Self::Gcr => "gcr",
            Self::Acr => "acr",
            Self::Harbor => "harbor",
            Self::Generic => "default",
        };
        write!(f, "{}", name)
    }
}

/// A repository address split into registry host and repository path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryAddress {
    pub host: String,
    pub path: String,
}

impl RepositoryAddress {
    /// Parse `[host/]path`. The first component is a host when it contains
    /// a dot or a port, or is `localhost`.
    pub fn parse(repository: &str) -> Self {
        match repository.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                Self {
                    host: first.to_string(),
                    path: rest.to_string(),
                }
            }
            _ => {
                let path = if repository.contains('/') {
                    repository.to_string()
                } else {
                    format!("library/{}", repository)
                };
                Self {
                    host: DOCKER_HUB_HOST.to_string(),
                    path,
                }
            }
        }
    }
}

/// Registry operations used by stages storage and publishing
#[async_trait]
pub trait Registry: Send + Sync {
    /// All tags of `repository`
    async fn tags(&self, repository: &str) -> ConveyorResult<Vec<String>>;

    /// Metadata of `reference`, `None` if the tag does not exist
    async fn get_artifact_info(&self, reference: &str) -> ConveyorResult<Option<ImageInfo>>;

    /// Delete the manifest behind `reference`
    async fn delete(&self, reference: &str) -> ConveyorResult<()>;

    /// Upload a locally tagged reference. Layers move through the engine.
    async fn push(&self, engine: &dyn ContainerEngine, reference: &str) -> ConveyorResult<()> {
        engine.push(reference).await
    }

    fn vendor(&self) -> RegistryVendor;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_repository_address() {
        assert_eq!(
            RepositoryAddress::parse("registry.example.com/team/app"),
            RepositoryAddress {
                host: "registry.example.com".to_string(),
                path: "team/app".to_string()
            }
        );
        assert_eq!(
            RepositoryAddress::parse("localhost:5000/app"),
            RepositoryAddress {
                host: "localhost:5000".to_string(),
                path: "app".to_string()
            }
        );
        assert_eq!(RepositoryAddress::parse("ubuntu").path, "library/ubuntu");
        assert_eq!(RepositoryAddress::parse("team/app").host, DOCKER_HUB_HOST);
    }

    #[test]
    fn detect_vendor() {
        assert_eq!(RegistryVendor::detect("ghcr.io/org/app"), RegistryVendor::GitHubPackages);
        assert_eq!(
            RegistryVendor::detect("123.dkr.ecr.eu-west-1.amazonaws.com/app"),
            RegistryVendor::Ecr
        );
        assert_eq!(RegistryVendor::detect("org/app"), RegistryVendor::DockerHub);
        assert_eq!(
            RegistryVendor::detect("europe-docker.pkg.dev/p/r/app"),
            RegistryVendor::Gcr
        );
        assert_eq!(
            RegistryVendor::detect("registry.gitlab.com/g/p"),
            RegistryVendor::GitLab
        );
        assert_eq!(
            RegistryVendor::detect("localhost:5000/app"),
            RegistryVendor::Generic
        );
    }

    #[test]
    fn delete_support() {
        assert!(!RegistryVendor::DockerHub.supports_delete());
        assert!(RegistryVendor::Generic.supports_delete());
    }
}
