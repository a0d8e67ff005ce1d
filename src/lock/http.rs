//! Locks held by a lock server shared between hosts
//!
//! JSON over HTTP POST:
//!
//! - `/acquire` `{"key", "leaseSeconds"}` answers `{"err", "acquired", "lockHandle"}`
//! - `/renew-lease` `{"lockHandle"}` answers `{"err"}`
//! - `/release` `{"lockHandle"}` answers `{"err"}`
//!
//! The server never parks a request; blocking acquisition polls. A held
//! lease is renewed in the background until the handle is released or
//! dropped. A dropped handle stops renewing and the server frees the lock
//! once the lease runs out.

use super::{LockBackend, LockGuard, LockHandle};
use crate::error::{ConveyorError, ConveyorResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use ureq::Agent;

const ACQUIRE_PATH: &str = "acquire";
const RENEW_PATH: &str = "renew-lease";
const RELEASE_PATH: &str = "release";

const DEFAULT_LEASE: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-side identity of a held lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RemoteHandle {
    id: String,
    key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcquireRequest {
    key: String,
    lease_seconds: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AcquireResponse {
    err: Option<String>,
    acquired: bool,
    lock_handle: Option<RemoteHandle>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HandleRequest {
    lock_handle: RemoteHandle,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrResponse {
    err: Option<String>,
}

/// The server reports success as a missing or empty `err`
fn server_error(err: Option<String>) -> Option<String> {
    err.filter(|e| !e.is_empty())
}

/// A lease kept alive by a renewal task
pub(crate) struct Lease {
    remote: RemoteHandle,
    renewal: JoinHandle<()>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

/// Blocking HTTP side, cheap to clone into worker threads
#[derive(Clone)]
struct Client {
    agent: Agent,
    server: String,
}

impl Client {
    fn post<Req: Serialize, Resp: DeserializeOwned>(&self, path: &str, body: &Req) -> Result<Resp, String> {
        let url = format!("{}/{}", self.server, path);
        let payload = serde_json::to_string(body).map_err(|e| e.to_string())?;
        let mut response = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .send(payload)
            .map_err(|e| format!("{}: {}", url, e))?;
        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .read_to_string()
            .map_err(|e| format!("{}: {}", url, e))?;
        if !(200..300).contains(&status) {
            return Err(format!("{} answered {}: {}", url, status, text.trim()));
        }
        serde_json::from_str(&text).map_err(|e| format!("{}: malformed reply: {}", url, e))
    }
}

async fn call<Req, Resp>(client: &Client, path: &'static str, body: Req) -> Result<Resp, String>
where
    Req: Serialize + Send + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    let client = client.clone();
    tokio::task::spawn_blocking(move || client.post(path, &body))
        .await
        .map_err(|e| format!("lock server worker failed: {}", e))?
}

/// Locks kept by a lock server, shared by every runner that talks to it
pub struct HttpLockBackend {
    client: Client,
    lease: Duration,
    poll_interval: Duration,
}

impl HttpLockBackend {
    /// Backend for the server at `address` (`host:port` or a full URL)
    pub fn new(address: &str) -> Self {
        let address = address.trim_end_matches('/');
        let server = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        let agent = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build()
            .into();
        Self {
            client: Client { agent, server },
            lease: DEFAULT_LEASE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn server(&self) -> &str {
        &self.client.server
    }

    fn spawn_renewal(&self, remote: RemoteHandle) -> JoinHandle<()> {
        let client = self.client.clone();
        let interval = self.lease / 3;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let request = HandleRequest {
                    lock_handle: remote.clone(),
                };
                match call::<_, ErrResponse>(&client, RENEW_PATH, request).await {
                    Ok(reply) => {
                        if let Some(err) = server_error(reply.err) {
                            warn!("Lease on {} was not renewed: {}", remote.key, err);
                        }
                    }
                    Err(reason) => warn!("Lease on {} was not renewed: {}", remote.key, reason),
                }
            }
        })
    }
}

#[async_trait]
impl LockBackend for HttpLockBackend {
    async fn acquire(&self, key: &str, blocking: bool) -> ConveyorResult<Option<LockHandle>> {
        let failed = |reason: String| ConveyorError::LockAcquire {
            key: key.to_string(),
            reason,
        };
        let mut waiting = false;
        loop {
            let request = AcquireRequest {
                key: key.to_string(),
                lease_seconds: self.lease.as_secs().max(1),
            };
            let reply: AcquireResponse = call(&self.client, ACQUIRE_PATH, request)
                .await
                .map_err(failed)?;
            if let Some(err) = server_error(reply.err) {
                return Err(failed(err));
            }
            match (reply.acquired, reply.lock_handle) {
                (true, Some(remote)) => {
                    debug!("Locked {} on {} ({})", key, self.client.server, remote.id);
                    let renewal = self.spawn_renewal(remote.clone());
                    return Ok(Some(LockHandle::new(key, LockGuard::Http(Lease { remote, renewal }))));
                }
                (true, None) => return Err(failed("granted without a lock handle".to_string())),
                (false, _) if !blocking => return Ok(None),
                (false, _) => {
                    if !waiting {
                        debug!("Waiting for {} held on {}", key, self.client.server);
                        waiting = true;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn release(&self, handle: LockHandle) -> ConveyorResult<()> {
        let LockHandle { key, guard } = handle;
        let LockGuard::Http(lease) = guard else {
            return Ok(());
        };
        let remote = lease.remote.clone();
        drop(lease);

        let failed = |reason: String| ConveyorError::LockRelease {
            key: key.clone(),
            reason,
        };
        let reply: ErrResponse = call(
            &self.client,
            RELEASE_PATH,
            HandleRequest { lock_handle: remote },
        )
        .await
        .map_err(failed)?;
        if let Some(err) = server_error(reply.err) {
            return Err(failed(err));
        }
        debug!("Released {} on {}", key, self.client.server);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};

    /// Minimal lock server: one request per connection, leases never expire
    #[derive(Default)]
    struct ServerState {
        held: HashMap<String, String>,
        issued: u64,
        renewals: usize,
    }

    impl ServerState {
        fn answer(&mut self, path: &str, request: &Value) -> Value {
            let handle = &request["lockHandle"];
            match path {
                "/acquire" => {
                    let key = request["key"].as_str().unwrap_or_default().to_string();
                    if key == "denied" {
                        return json!({ "err": "permission denied" });
                    }
                    if self.held.contains_key(&key) {
                        return json!({ "err": "", "acquired": false });
                    }
                    self.issued += 1;
                    let id = format!("lease-{}", self.issued);
                    self.held.insert(key.clone(), id.clone());
                    json!({ "err": "", "acquired": true, "lockHandle": { "id": id, "key": key } })
                }
                "/renew-lease" => {
                    self.renewals += 1;
                    json!({ "err": null })
                }
                "/release" => {
                    let key = handle["key"].as_str().unwrap_or_default();
                    match self.held.get(key) {
                        Some(id) if Some(id.as_str()) == handle["id"].as_str() => {
                            self.held.remove(key);
                            json!({})
                        }
                        _ => json!({ "err": format!("{} is not held", key) }),
                    }
                }
                _ => json!({ "err": format!("no route {}", path) }),
            }
        }
    }

    fn handle_connection(stream: TcpStream, state: &Mutex<ServerState>) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut request_line = String::new();
        reader.read_line(&mut request_line).unwrap();
        let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();

        let mut length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    length = value.trim().parse().unwrap();
                }
            }
        }
        let mut body = vec![0; length];
        reader.read_exact(&mut body).unwrap();
        let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

        let reply = state.lock().unwrap().answer(&path, &request).to_string();
        let mut stream = stream;
        write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            reply.len(),
            reply
        )
        .unwrap();
    }

    fn start_server() -> (String, Arc<Mutex<ServerState>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(ServerState::default()));
        let shared = state.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                handle_connection(stream, &shared);
            }
        });
        (address, state)
    }

    #[test]
    fn addresses_default_to_http() {
        assert_eq!(HttpLockBackend::new("sync.local:55581").server(), "http://sync.local:55581");
        assert_eq!(
            HttpLockBackend::new("https://sync.local/locks/").server(),
            "https://sync.local/locks"
        );
    }

    #[test]
    fn acquire_request_format() {
        let request = AcquireRequest {
            key: "demo.stage.abc".to_string(),
            lease_seconds: 30,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "key": "demo.stage.abc", "leaseSeconds": 30 })
        );
        let reply: AcquireResponse = serde_json::from_value(json!({ "acquired": false })).unwrap();
        assert!(!reply.acquired);
        assert_eq!(server_error(reply.err), None);
    }

    #[tokio::test]
    async fn held_lock_is_refused_until_released() {
        let (address, state) = start_server();
        let backend = HttpLockBackend::new(&address);

        let held = backend.acquire("demo.stage.abc", false).await.unwrap();
        assert!(held.is_some());
        assert!(backend.acquire("demo.stage.abc", false).await.unwrap().is_none());
        assert!(backend.acquire("demo.stage.def", false).await.unwrap().is_some());

        backend.release(held.unwrap()).await.unwrap();
        assert!(!state.lock().unwrap().held.contains_key("demo.stage.abc"));
        assert!(backend.acquire("demo.stage.abc", false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_release() {
        let (address, _state) = start_server();
        let backend = Arc::new(HttpLockBackend::new(&address).with_poll_interval(Duration::from_millis(10)));
        let first = backend.acquire("demo.image.app", true).await.unwrap().unwrap();

        let other = backend.clone();
        let waiter = tokio::spawn(async move { other.acquire("demo.image.app", true).await.map(|h| h.is_some()) });
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!waiter.is_finished());

        backend.release(first).await.unwrap();
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn lease_is_renewed_while_held() {
        let (address, state) = start_server();
        let backend = HttpLockBackend::new(&address).with_lease(Duration::from_millis(150));

        let handle = backend.acquire("host.gc", false).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let renewed = state.lock().unwrap().renewals;
        assert!(renewed >= 1);

        drop(handle);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = state.lock().unwrap().renewals;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(state.lock().unwrap().renewals, settled);
    }

    #[tokio::test]
    async fn server_errors_are_reported() {
        let (address, _state) = start_server();
        let backend = HttpLockBackend::new(&address);
        let err = backend.acquire("denied", true).await.unwrap_err();
        match err {
            ConveyorError::LockAcquire { key, reason } => {
                assert_eq!(key, "denied");
                assert_eq!(reason, "permission denied");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unreachable_server_fails_acquire() {
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let err = HttpLockBackend::new(&address)
            .acquire("demo.stage.abc", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::LockAcquire { .. }));
    }
}
