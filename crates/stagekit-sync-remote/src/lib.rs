//! Remote settings sync: availability probe, sanitized push, fetch, and a
//! bounded background worker.
//!
//! Sync is strictly best-effort. Nothing in this crate ever surfaces a
//! remote failure to the caller: a push that cannot complete is logged and
//! dropped, a fetch that cannot complete resolves to `None`, and the local
//! store remains the source of truth throughout.

use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use stagekit_core::sanitize_for_sync;
use tracing::{debug, warn};

/// Default timeout for the availability probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default depth of the background push queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

/// Connection settings for the remote settings service.
#[derive(Debug, Clone)]
pub struct RemoteSyncConfig {
    pub base_url: String,
    pub probe_timeout: Duration,
}

impl RemoteSyncConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url, probe_timeout: DEFAULT_PROBE_TIMEOUT }
    }
}

#[derive(Debug, Deserialize)]
struct PushAck {
    success: bool,
}

/// HTTP client for the remote settings service.
#[derive(Debug, Clone)]
pub struct RemoteSettingsGateway {
    config: RemoteSyncConfig,
    agent: ureq::Agent,
}

impl RemoteSettingsGateway {
    #[must_use]
    pub fn new(config: RemoteSyncConfig) -> Self {
        Self { config, agent: ureq::Agent::new() }
    }

    /// Probe the service's health endpoint. Probed on every call, never
    /// cached; any non-200 response or transport error means unavailable.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let url = format!("{}/health", self.config.base_url);
        match self.agent.get(&url).timeout(self.config.probe_timeout).call() {
            Ok(response) => response.status() == 200,
            Err(err) => {
                debug!(error = %err, "remote settings service unreachable");
                false
            }
        }
    }

    /// Push one settings payload. Best-effort: the payload is sanitized
    /// first, and every failure (unavailable service, transport error,
    /// rejected push) is logged and dropped. Never retries.
    pub fn push_settings(&self, key: &str, value: &Value) {
        if !self.is_available() {
            warn!(key, "skipping settings push, remote service unavailable");
            return;
        }
        let payload = sanitize_for_sync(value);
        let url = format!("{}/settings", self.config.base_url);
        let body = serde_json::json!({ "key": key, "payload": payload });
        match self.agent.post(&url).send_json(body) {
            Ok(response) => match response.into_json::<PushAck>() {
                Ok(ack) if ack.success => debug!(key, "settings pushed"),
                Ok(_) => warn!(key, "remote service rejected settings push"),
                Err(err) => warn!(key, error = %err, "unreadable push acknowledgement"),
            },
            Err(err) => warn!(key, error = %err, "settings push failed"),
        }
    }

    /// Fetch one settings payload. A missing key (404), an unavailable
    /// service, or any transport failure resolves to `None`.
    #[must_use]
    pub fn fetch_settings(&self, key: &str) -> Option<Value> {
        if !self.is_available() {
            return None;
        }
        let url = format!("{}/settings/{key}", self.config.base_url);
        match self.agent.get(&url).call() {
            Ok(response) => match response.into_json::<Value>() {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(key, error = %err, "unreadable settings payload");
                    None
                }
            },
            Err(ureq::Error::Status(404, _)) => None,
            Err(err) => {
                warn!(key, error = %err, "settings fetch failed");
                None
            }
        }
    }
}

enum SyncJob {
    Push { key: String, value: Value },
}

/// Background thread draining a bounded queue of push jobs.
///
/// Enqueueing never blocks the caller: when the queue is full the job is
/// dropped with a warning. `shutdown` closes the queue and joins the
/// thread, which drains everything already enqueued first.
#[derive(Debug)]
pub struct SyncWorker {
    tx: Option<SyncSender<SyncJob>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncWorker {
    #[must_use]
    pub fn spawn(gateway: RemoteSettingsGateway) -> Self {
        Self::spawn_with_depth(gateway, DEFAULT_QUEUE_DEPTH)
    }

    #[must_use]
    pub fn spawn_with_depth(gateway: RemoteSettingsGateway, depth: usize) -> Self {
        let (tx, rx) = sync_channel::<SyncJob>(depth);
        let handle = std::thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                match job {
                    SyncJob::Push { key, value } => gateway.push_settings(&key, &value),
                }
            }
        });
        Self { tx: Some(tx), handle: Some(handle) }
    }

    /// Queue a push without blocking. A full queue drops the job.
    pub fn enqueue_push(&self, key: &str, value: &Value) {
        let Some(tx) = self.tx.as_ref() else {
            warn!(key, "sync worker already shut down, dropping push");
            return;
        };
        let job = SyncJob::Push { key: key.to_string(), value: value.clone() };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(key, "sync queue full, dropping push");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(key, "sync worker gone, dropping push");
            }
        }
    }

    /// Close the queue and wait for the worker to drain it.
    pub fn shutdown(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sync worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stagekit_core::{IMAGE_SYNC_LIMIT_BYTES, OVERSIZED_IMAGE_TOKEN};
    use std::collections::HashMap;
    use std::io::Read;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use tiny_http::{Header, Method, Response, Server};

    type Stored = Arc<Mutex<HashMap<String, Value>>>;

    struct StubService {
        server: Arc<Server>,
        stored: Stored,
        handle: Option<std::thread::JoinHandle<()>>,
    }

    impl StubService {
        fn start() -> anyhow::Result<Self> {
            let server = Arc::new(
                Server::http("127.0.0.1:0").map_err(|err| anyhow::anyhow!("stub server: {err}"))?,
            );
            let stored: Stored = Arc::new(Mutex::new(HashMap::new()));
            let loop_server = Arc::clone(&server);
            let loop_stored = Arc::clone(&stored);
            let handle = std::thread::spawn(move || {
                for mut request in loop_server.incoming_requests() {
                    let url = request.url().to_string();
                    let method = request.method().clone();
                    let response = match (method, url.as_str()) {
                        (Method::Get, "/health") => json_response("{\"status\":\"ok\"}"),
                        (Method::Post, "/settings") => {
                            let mut body = String::new();
                            if request.as_reader().read_to_string(&mut body).is_err() {
                                json_response("{\"success\":false}")
                            } else {
                                match serde_json::from_str::<Value>(&body) {
                                    Ok(parsed) => {
                                        let key = parsed["key"].as_str().unwrap_or_default().to_string();
                                        let payload = parsed["payload"].clone();
                                        if let Ok(mut map) = loop_stored.lock() {
                                            map.insert(key, payload);
                                        }
                                        json_response("{\"success\":true}")
                                    }
                                    Err(_) => json_response("{\"success\":false}"),
                                }
                            }
                        }
                        (Method::Get, path) if path.starts_with("/settings/") => {
                            let key = path.trim_start_matches("/settings/");
                            let payload = loop_stored.lock().ok().and_then(|map| map.get(key).cloned());
                            match payload {
                                Some(value) => json_response(&value.to_string()),
                                None => Response::from_string("not found").with_status_code(404),
                            }
                        }
                        _ => Response::from_string("bad request").with_status_code(400),
                    };
                    let _ = request.respond(response);
                }
            });
            Ok(Self { server, stored, handle: Some(handle) })
        }

        fn base_url(&self) -> anyhow::Result<String> {
            let addr = self
                .server
                .server_addr()
                .to_ip()
                .ok_or_else(|| anyhow::anyhow!("stub server has no ip address"))?;
            Ok(format!("http://{addr}"))
        }

        fn stored(&self, key: &str) -> Option<Value> {
            self.stored.lock().ok().and_then(|map| map.get(key).cloned())
        }
    }

    impl Drop for StubService {
        fn drop(&mut self) {
            self.server.unblock();
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn json_response(body: &str) -> Response<std::io::Cursor<Vec<u8>>> {
        let mut response = Response::from_string(body);
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
            response = response.with_header(header);
        }
        response
    }

    #[test]
    fn push_then_fetch_round_trips_through_the_service() -> anyhow::Result<()> {
        let stub = StubService::start()?;
        let gateway = RemoteSettingsGateway::new(RemoteSyncConfig::new(stub.base_url()?));

        assert!(gateway.is_available());
        gateway.push_settings("introSettings", &json!({"title": "Welcome"}));
        let fetched = gateway.fetch_settings("introSettings");
        assert_eq!(fetched, Some(json!({"title": "Welcome"})));
        Ok(())
    }

    #[test]
    fn oversized_images_are_replaced_in_transit() -> anyhow::Result<()> {
        let stub = StubService::start()?;
        let gateway = RemoteSettingsGateway::new(RemoteSyncConfig::new(stub.base_url()?));

        let big = format!("data:image/png;base64,{}", "A".repeat(IMAGE_SYNC_LIMIT_BYTES + 1));
        gateway.push_settings("backgroundSettings", &json!({"image": big}));

        let remote = stub
            .stored("backgroundSettings")
            .ok_or_else(|| anyhow::anyhow!("payload never arrived"))?;
        assert_eq!(remote["image"], OVERSIZED_IMAGE_TOKEN);
        Ok(())
    }

    #[test]
    fn unknown_key_fetches_as_none() -> anyhow::Result<()> {
        let stub = StubService::start()?;
        let gateway = RemoteSettingsGateway::new(RemoteSyncConfig::new(stub.base_url()?));
        assert_eq!(gateway.fetch_settings("neverStored"), None);
        Ok(())
    }

    #[test]
    fn unreachable_service_degrades_quietly() {
        // reserved port, nothing listens
        let mut config = RemoteSyncConfig::new("http://127.0.0.1:9");
        config.probe_timeout = Duration::from_millis(100);
        let gateway = RemoteSettingsGateway::new(config);

        assert!(!gateway.is_available());
        gateway.push_settings("introSettings", &json!({"title": "A"}));
        assert_eq!(gateway.fetch_settings("introSettings"), None);
    }

    #[test]
    fn shutdown_drains_enqueued_pushes() -> anyhow::Result<()> {
        let stub = StubService::start()?;
        let gateway = RemoteSettingsGateway::new(RemoteSyncConfig::new(stub.base_url()?));
        let mut worker = SyncWorker::spawn(gateway);

        for index in 0..5 {
            worker.enqueue_push(&format!("surface{index}"), &json!({"index": index}));
        }
        worker.shutdown();

        for index in 0..5 {
            assert_eq!(stub.stored(&format!("surface{index}")), Some(json!({"index": index})));
        }
        Ok(())
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        // a worker stuck on an unreachable host cannot drain, so the
        // bounded queue fills up and later pushes must return immediately
        let mut config = RemoteSyncConfig::new("http://127.0.0.1:9");
        config.probe_timeout = Duration::from_millis(200);
        let gateway = RemoteSettingsGateway::new(config);
        let worker = SyncWorker::spawn_with_depth(gateway, 2);

        let (done_tx, done_rx) = mpsc::channel();
        let pusher = std::thread::spawn(move || {
            for index in 0..50 {
                worker.enqueue_push("surface", &json!({"index": index}));
            }
            let _ = done_tx.send(());
            drop(worker);
        });
        let finished = done_rx.recv_timeout(Duration::from_secs(5)).is_ok();
        let _ = pusher.join();
        assert!(finished, "enqueue_push blocked on a full queue");
    }
}
