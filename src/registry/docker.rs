//! Docker Registry HTTP API v2 client
//!
//! Reads tags, manifests and image configs over HTTPS with bearer-token
//! auth. Requests are blocking (ureq) and run on the blocking thread pool.

use super::{Registry, RegistryVendor, RepositoryAddress};
use crate::error::{ConveyorError, ConveyorResult};
use crate::storage::{split_reference, ImageInfo};
use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use ureq::http::Response;
use ureq::{Agent, Body};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// Basic credentials for a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl RegistryCredentials {
    /// Read `CONVEYOR_REGISTRY_USERNAME` and `CONVEYOR_REGISTRY_PASSWORD`
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("CONVEYOR_REGISTRY_USERNAME").ok()?;
        let password = std::env::var("CONVEYOR_REGISTRY_PASSWORD").ok()?;
        Some(Self { username, password })
    }

    fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", BASE64_STANDARD.encode(raw))
    }
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    platform: Option<PlatformSpec>,
}

#[derive(Debug, Deserialize)]
struct PlatformSpec {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    /// Present on image indexes / manifest lists
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    config: Option<ConfigSection>,
}

#[derive(Debug, Deserialize)]
struct ConfigSection {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Copy)]
enum Method {
    Get,
    Delete,
}

/// Blocking HTTP side of the registry, cheap to clone into worker threads
#[derive(Clone)]
struct Client {
    agent: Agent,
    credentials: Option<RegistryCredentials>,
    insecure: bool,
    tokens: Arc<Mutex<HashMap<String, String>>>,
}

struct Reply {
    status: u16,
    digest: Option<String>,
    next: Option<String>,
    body: String,
}

impl Client {
    fn base_url(&self, host: &str) -> String {
        let plain = self.insecure || host.starts_with("localhost") || host.starts_with("127.0.0.1");
        format!("{}://{}", if plain { "http" } else { "https" }, host)
    }

    fn send(&self, method: Method, url: &str, accept: Option<&str>, auth: Option<&str>) -> ConveyorResult<Response<Body>> {
        let mut request = match method {
            Method::Get => self.agent.get(url),
            Method::Delete => self.agent.delete(url),
        };
        if let Some(accept) = accept {
            request = request.header("Accept", accept);
        }
        if let Some(auth) = auth {
            request = request.header("Authorization", auth);
        }
        request.call().map_err(|e| registry_error(url, e))
    }

    /// Send a request, answering a bearer challenge once if needed
    fn request(&self, method: Method, url: &str, scope: &str, accept: Option<&str>) -> ConveyorResult<Reply> {
        let cached = self.cached_token(scope);
        let auth = cached
            .map(|t| format!("Bearer {}", t))
            .or_else(|| self.credentials.as_ref().map(RegistryCredentials::basic_header));

        let mut response = self.send(method, url, accept, auth.as_deref())?;
        if response.status().as_u16() == 401 {
            let challenge = response
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Some(challenge) = challenge.as_deref().and_then(parse_bearer_challenge) {
                let token = self.fetch_token(&challenge, scope)?;
                let bearer = format!("Bearer {}", token);
                response = self.send(method, url, accept, Some(&bearer))?;
            }
        }

        let status = response.status().as_u16();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let digest = header("docker-content-digest");
        let next = header("link").and_then(|l| parse_next_link(&l));
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| registry_error(url, e))?;
        Ok(Reply {
            status,
            digest,
            next,
            body,
        })
    }

    fn cached_token(&self, scope: &str) -> Option<String> {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.get(scope).cloned()
    }

    fn fetch_token(&self, challenge: &HashMap<String, String>, scope: &str) -> ConveyorResult<String> {
        let realm = challenge.get("realm").ok_or_else(|| ConveyorError::Registry {
            url: scope.to_string(),
            reason: "bearer challenge without realm".to_string(),
        })?;
        let mut request = self.agent.get(realm.as_str());
        if let Some(service) = challenge.get("service") {
            request = request.query("service", service);
        }
        let wanted = challenge.get("scope").map(String::as_str).unwrap_or(scope);
        request = request.query("scope", wanted);
        if let Some(credentials) = &self.credentials {
            request = request.header("Authorization", credentials.basic_header());
        }

        let mut response = request.call().map_err(|e| registry_error(realm, e))?;
        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| registry_error(realm, e))?;
        if status != 200 {
            return Err(ConveyorError::Registry {
                url: realm.clone(),
                reason: format!("token request returned {}", status),
            });
        }

        #[derive(Deserialize)]
        struct TokenReply {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }
        let reply: TokenReply = serde_json::from_str(&body)?;
        let token = reply
            .token
            .or(reply.access_token)
            .ok_or_else(|| ConveyorError::Registry {
                url: realm.clone(),
                reason: "token response without token".to_string(),
            })?;

        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.insert(scope.to_string(), token.clone());
        Ok(token)
    }

    fn tags(&self, repository: &str) -> ConveyorResult<Vec<String>> {
        let address = RepositoryAddress::parse(repository);
        let base = self.base_url(&address.host);
        let scope = format!("repository:{}:pull", address.path);

        let mut url = format!("{}/v2/{}/tags/list?n=1000", base, address.path);
        let mut tags = Vec::new();
        loop {
            let reply = self.request(Method::Get, &url, &scope, None)?;
            match reply.status {
                200 => {}
                404 => return Ok(tags),
                status => return Err(unexpected_status(&url, status, &reply.body)),
            }
            let list: TagList = serde_json::from_str(&reply.body)?;
            tags.extend(list.tags.unwrap_or_default());
            match reply.next {
                Some(next) if next.starts_with('/') => url = format!("{}{}", base, next),
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(tags)
    }

    fn manifest(&self, base: &str, path: &str, reference: &str, scope: &str) -> ConveyorResult<Option<(Manifest, Option<String>)>> {
        let url = format!("{}/v2/{}/manifests/{}", base, path, reference);
        let reply = self.request(Method::Get, &url, scope, Some(MANIFEST_ACCEPT))?;
        match reply.status {
            200 => Ok(Some((serde_json::from_str(&reply.body)?, reply.digest))),
            404 => Ok(None),
            status => Err(unexpected_status(&url, status, &reply.body)),
        }
    }

    fn artifact_info(&self, reference: &str) -> ConveyorResult<Option<ImageInfo>> {
        let (repository, tag) = split_reference(reference);
        let tag = tag.unwrap_or("latest");
        let address = RepositoryAddress::parse(repository);
        let base = self.base_url(&address.host);
        let scope = format!("repository:{}:pull", address.path);

        let Some((mut manifest, _)) = self.manifest(&base, &address.path, tag, &scope)? else {
            return Ok(None);
        };
        if !manifest.manifests.is_empty() {
            let chosen = manifest
                .manifests
                .iter()
                .find(|m| {
                    m.platform
                        .as_ref()
                        .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
                })
                .or_else(|| manifest.manifests.first())
                .map(|m| m.digest.clone());
            let Some(digest) = chosen else {
                return Ok(None);
            };
            match self.manifest(&base, &address.path, &digest, &scope)? {
                Some((inner, _)) => manifest = inner,
                None => return Ok(None),
            }
        }

        let config = manifest.config.ok_or_else(|| ConveyorError::Registry {
            url: reference.to_string(),
            reason: "manifest has no config".to_string(),
        })?;
        let url = format!("{}/v2/{}/blobs/{}", base, address.path, config.digest);
        let reply = self.request(Method::Get, &url, &scope, None)?;
        if reply.status != 200 {
            return Err(unexpected_status(&url, reply.status, &reply.body));
        }
        let blob: ConfigBlob = serde_json::from_str(&reply.body)?;

        let labels = blob.config.and_then(|c| c.labels).unwrap_or_default();
        let size = manifest.layers.iter().map(|l| l.size).sum();
        let mut info = ImageInfo::new(&format!("{}:{}", repository, tag), &config.digest, labels)
            .with_size(size);
        if let Some(created) = blob
            .created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        {
            info = info.with_created_at(created.with_timezone(&Utc));
        }
        Ok(Some(info))
    }

    fn delete(&self, reference: &str) -> ConveyorResult<()> {
        let (repository, tag) = split_reference(reference);
        let tag = tag.unwrap_or("latest");
        let address = RepositoryAddress::parse(repository);
        let base = self.base_url(&address.host);
        let scope = format!("repository:{}:pull,push,delete", address.path);

        let Some((_, digest)) = self.manifest(&base, &address.path, tag, &scope)? else {
            debug!("{} already gone", reference);
            return Ok(());
        };
        let digest = digest.ok_or_else(|| ConveyorError::Registry {
            url: reference.to_string(),
            reason: "registry did not report a manifest digest".to_string(),
        })?;

        let url = format!("{}/v2/{}/manifests/{}", base, address.path, digest);
        let reply = self.request(Method::Delete, &url, &scope, None)?;
        match reply.status {
            200 | 202 | 404 => Ok(()),
            status => Err(unexpected_status(&url, status, &reply.body)),
        }
    }
}

/// Registry reached through the Docker Registry v2 API
pub struct DockerRegistry {
    client: Client,
    vendor: RegistryVendor,
}

impl DockerRegistry {
    pub fn new(address: &str, credentials: Option<RegistryCredentials>, insecure: bool) -> Self {
        let config = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(60)))
            .build();
        Self {
            client: Client {
                agent: config.into(),
                credentials,
                insecure,
                tokens: Arc::new(Mutex::new(HashMap::new())),
            },
            vendor: RegistryVendor::detect(address),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> ConveyorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Client) -> ConveyorResult<T> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || op(client))
            .await
            .map_err(|e| ConveyorError::Internal(format!("registry worker failed: {}", e)))?
    }
}

#[async_trait]
impl Registry for DockerRegistry {
    async fn tags(&self, repository: &str) -> ConveyorResult<Vec<String>> {
        let repository = repository.to_string();
        self.blocking(move |client| client.tags(&repository)).await
    }

    async fn get_artifact_info(&self, reference: &str) -> ConveyorResult<Option<ImageInfo>> {
        let reference = reference.to_string();
        self.blocking(move |client| client.artifact_info(&reference))
            .await
    }

    async fn delete(&self, reference: &str) -> ConveyorResult<()> {
        if !self.vendor.supports_delete() {
            return Err(ConveyorError::RegistryUnsupported {
                registry: self.vendor.to_string(),
                operation: "manifest deletion".to_string(),
            });
        }
        let reference = reference.to_string();
        self.blocking(move |client| client.delete(&reference)).await
    }

    fn vendor(&self) -> RegistryVendor {
        self.vendor
    }
}

fn registry_error(url: &str, error: ureq::Error) -> ConveyorError {
    ConveyorError::Registry {
        url: url.to_string(),
        reason: error.to_string(),
    }
}

fn unexpected_status(url: &str, status: u16, body: &str) -> ConveyorError {
    let body: String = body.chars().take(200).collect();
    ConveyorError::Registry {
        url: url.to_string(),
        reason: format!("unexpected status {}: {}", status, body.trim()),
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."`
fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let (scheme, rest) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut params = HashMap::new();
    let mut rest = rest.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        params.insert(key, value.to_string());
        rest = remaining.trim_start_matches(',').trim();
    }
    Some(params)
}

/// Extract the target of a `Link: <...>; rel="next"` header
fn parse_next_link(header: &str) -> Option<String> {
    if !header.contains("rel=\"next\"") {
        return None;
    }
    let start = header.find('<')?;
    let end = header[start..].find('>')?;
    Some(header[start + 1..start + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_challenge_with_comma_in_scope() {
        let params = parse_bearer_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:team/app:pull,push""#,
        )
        .unwrap();
        assert_eq!(params["realm"], "https://auth.example.com/token");
        assert_eq!(params["service"], "registry.example.com");
        assert_eq!(params["scope"], "repository:team/app:pull,push");
    }

    #[test]
    fn basic_challenge_is_ignored() {
        assert!(parse_bearer_challenge(r#"Basic realm="x""#).is_none());
    }

    #[test]
    fn next_link() {
        assert_eq!(
            parse_next_link(r#"</v2/app/tags/list?last=b&n=2>; rel="next""#).as_deref(),
            Some("/v2/app/tags/list?last=b&n=2")
        );
        assert_eq!(parse_next_link(r#"</v2/x>; rel="prev""#), None);
    }

    #[test]
    #[serial_test::serial]
    fn credentials_need_both_variables() {
        std::env::set_var("CONVEYOR_REGISTRY_USERNAME", "ci");
        std::env::remove_var("CONVEYOR_REGISTRY_PASSWORD");
        assert_eq!(RegistryCredentials::from_env(), None);

        std::env::set_var("CONVEYOR_REGISTRY_PASSWORD", "secret");
        let credentials = RegistryCredentials::from_env();
        std::env::remove_var("CONVEYOR_REGISTRY_USERNAME");
        std::env::remove_var("CONVEYOR_REGISTRY_PASSWORD");
        assert_eq!(credentials.map(|c| c.username), Some("ci".to_string()));
    }

    #[test]
    fn basic_header_encoding() {
        let credentials = RegistryCredentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        assert_eq!(credentials.basic_header(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn local_registries_use_plain_http() {
        let registry = DockerRegistry::new("localhost:5000/app", None, false);
        assert_eq!(registry.client.base_url("localhost:5000"), "http://localhost:5000");
        assert_eq!(registry.client.base_url("ghcr.io"), "https://ghcr.io");
        assert_eq!(registry.vendor(), RegistryVendor::Generic);
    }

    #[test]
    fn manifest_index_parses() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"manifests":[{"digest":"sha256:a","platform":{"architecture":"arm64","os":"linux"}},
                {"digest":"sha256:b","platform":{"architecture":"amd64","os":"linux"}}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.manifests.len(), 2);
        assert!(manifest.config.is_none());
    }
}
