// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Consul-backed exposer.
//!
//! Writes are idempotent upserts keyed `{prefix}/{host}/{workload}`, gated
//! by a server-side session so entries vanish when this host dies. The
//! writer keeps its own dirty map and syncs it to the KV store from a
//! background task: local state and remote state stay consistent, and the
//! instances publishing snapshots are never blocked on the network.
//!
//! Reads are blocking list queries on the prefix, keyed by Consul's
//! consistency index.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::{ExposeError, ExposedInstance, Exposer};

const SESSION_TTL: Duration = Duration::from_secs(10);
const WRITE_DEBOUNCE: Duration = Duration::from_secs(1);
const LIST_WAIT: Duration = Duration::from_secs(10);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const WRITE_QUEUE: usize = 20;

/// Minimal KV surface the writer needs. Split out so the worker logic is
/// testable against an in-memory store.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn create_session(&self, ttl: Duration) -> Result<String, ExposeError>;
    async fn renew_session(&self, session: &str) -> Result<(), ExposeError>;
    /// Session-gated upsert; `Ok(false)` means the lock was refused.
    async fn acquire(&self, key: &str, value: Vec<u8>, session: &str)
        -> Result<bool, ExposeError>;
    async fn delete(&self, key: &str) -> Result<(), ExposeError>;
    /// Blocking list: returns `(pairs, index)` once `index` advances past
    /// the given one, or after `wait` with the current view.
    async fn list(
        &self,
        prefix: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(Vec<(String, Vec<u8>)>, u64), ExposeError>;
}

/// Exposer replicating snapshots into a Consul KV prefix.
pub struct ConsulExposer {
    store: Arc<dyn KvStore>,
    prefix: String,
    writes: mpsc::Sender<ExposedInstance>,
}

impl ConsulExposer {
    /// Connect to the agent named by `CONSUL_HTTP_ADDR` (default
    /// `http://127.0.0.1:8500`).
    pub fn new(prefix: impl Into<String>, cancel: CancellationToken) -> Result<Self, ExposeError> {
        let store = Arc::new(ConsulStore::from_env()?);
        Ok(Self::with_store(store, prefix, cancel))
    }

    /// Build against any [`KvStore`]; used directly by tests.
    pub fn with_store(
        store: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        let prefix = prefix.into();
        let (writes, writes_rx) = mpsc::channel(WRITE_QUEUE);
        let (sessions_tx, sessions_rx) = mpsc::channel(1);

        tokio::spawn(session_task(store.clone(), sessions_tx, cancel.clone()));
        tokio::spawn(writer(store.clone(), prefix.clone(), writes_rx, sessions_rx, cancel));

        Self { store, prefix, writes }
    }
}

#[async_trait]
impl Exposer for ConsulExposer {
    async fn save_state(&self, record: ExposedInstance) {
        // Bounded enqueue; the writer owns all KV traffic.
        let _ = self.writes.send(record).await;
    }

    fn receive_states(&self, cancel: CancellationToken) -> mpsc::Receiver<Vec<ExposedInstance>> {
        let (tx, rx) = mpsc::channel(4);
        let store = self.store.clone();
        let prefix = self.prefix.clone();
        tokio::spawn(async move {
            let mut index = 0u64;
            let mut first = true;
            loop {
                let listed = tokio::select! {
                    _ = cancel.cancelled() => return,
                    listed = store.list(&prefix, index, LIST_WAIT) => listed,
                };
                match listed {
                    Ok((pairs, new_index)) => {
                        let advanced = first || new_index != index;
                        first = false;
                        index = new_index;
                        if !advanced {
                            continue;
                        }
                        let records = decode_pairs(pairs);
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = tx.send(records) => if sent.is_err() { return },
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "consul list failed");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
        });
        rx
    }
}

fn decode_pairs(pairs: Vec<(String, Vec<u8>)>) -> Vec<ExposedInstance> {
    let mut records = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        let mut parts = key.rsplit('/');
        let (Some(service), Some(host)) = (parts.next(), parts.next()) else {
            warn!(%key, "unparsable cluster state key");
            continue;
        };
        match serde_json::from_slice(&value) {
            Ok(snapshot) => records.push(ExposedInstance {
                host: host.to_string(),
                service: service.to_string(),
                snapshot,
            }),
            Err(e) => error!(%key, error = %e, "can't parse cluster state json"),
        }
    }
    records
}

/// Keep one live session at all times: create, announce to the writer,
/// renew at half the TTL, and start over when the agent loses it.
async fn session_task(
    store: Arc<dyn KvStore>,
    sessions: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        let session = tokio::select! {
            _ = cancel.cancelled() => return,
            created = store.create_session(SESSION_TTL) => match created {
                Ok(session) => session,
                Err(e) => {
                    error!(error = %e, "can't create session for consul exposer");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                    }
                }
            },
        };

        if sessions.send(session.clone()).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(SESSION_TTL / 2) => {}
            }
            if let Err(e) = store.renew_session(&session).await {
                error!(error = %e, "can't renew session for consul exposer");
                break;
            }
        }
    }
}

struct Entry {
    record: ExposedInstance,
    dirty: bool,
}

/// The dirty-map sync loop. Bursts are debounced to one flush per second;
/// failed writes stay dirty and get retried; a fresh session re-marks every
/// entry so the whole state is republished under the new lock.
async fn writer(
    store: Arc<dyn KvStore>,
    prefix: String,
    mut writes: mpsc::Receiver<ExposedInstance>,
    mut sessions: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let mut state: HashMap<String, Entry> = HashMap::new();
    let mut session = String::new();
    let mut flush_at: Option<Instant> = None;
    let mut last_flush: Option<Instant> = None;

    fn schedule(flush_at: &mut Option<Instant>, last_flush: Option<Instant>) {
        if flush_at.is_none() {
            let now = Instant::now();
            let earliest = match last_flush {
                Some(last) => last + WRITE_DEBOUNCE,
                None => now,
            };
            *flush_at = Some(earliest.max(now));
        }
    }

    loop {
        let deadline = flush_at.unwrap_or_else(Instant::now);
        tokio::select! {
            _ = cancel.cancelled() => return,

            record = writes.recv() => match record {
                Some(record) => {
                    state.insert(record.service.clone(), Entry { record, dirty: true });
                    schedule(&mut flush_at, last_flush);
                }
                None => return,
            },

            Some(new_session) = sessions.recv() => {
                session = new_session;
                for entry in state.values_mut() {
                    entry.dirty = true;
                }
                schedule(&mut flush_at, last_flush);
            },

            _ = tokio::time::sleep_until(deadline), if flush_at.is_some() => {
                flush_at = None;
                last_flush = Some(Instant::now());
                flush(store.as_ref(), &prefix, &mut state, &session).await;
                if !session.is_empty() && state.values().any(|e| e.dirty) {
                    schedule(&mut flush_at, last_flush);
                }
            }
        }
    }
}

async fn flush(store: &dyn KvStore, prefix: &str, state: &mut HashMap<String, Entry>, session: &str) {
    if session.is_empty() {
        // No lease yet; everything stays dirty until the session arrives.
        return;
    }

    let services: Vec<String> = state
        .iter()
        .filter(|(_, entry)| entry.dirty)
        .map(|(service, _)| service.clone())
        .collect();

    for service in services {
        let Some(entry) = state.get(&service) else { continue };
        let key = format!("{}/{}/{}", prefix, entry.record.host, service);

        if entry.record.is_stopped() {
            match store.delete(&key).await {
                Ok(()) => {
                    state.remove(&service);
                }
                Err(e) => error!(%key, error = %e, "can't delete snapshot from consul"),
            }
            continue;
        }

        let value = match serde_json::to_vec(&entry.record.snapshot) {
            Ok(value) => value,
            Err(e) => {
                error!(%key, error = %e, "can't encode snapshot to json");
                state.remove(&service);
                continue;
            }
        };
        match store.acquire(&key, value, session).await {
            Ok(true) => {
                if let Some(entry) = state.get_mut(&service) {
                    entry.dirty = false;
                }
            }
            Ok(false) => error!(%key, "can't put snapshot value to consul, lock refused"),
            Err(e) => error!(%key, error = %e, "can't put snapshot value to consul"),
        }
    }
}

/// [`KvStore`] over the Consul HTTP API.
pub struct ConsulStore {
    base: String,
    client: reqwest::Client,
}

impl ConsulStore {
    pub fn from_env() -> Result<Self, ExposeError> {
        let addr = std::env::var("CONSUL_HTTP_ADDR")
            .unwrap_or_else(|_| "http://127.0.0.1:8500".to_string());
        let base = if addr.contains("://") { addr } else { format!("http://{}", addr) };
        let client = reqwest::Client::builder()
            // Blocking list queries hold the connection for LIST_WAIT plus
            // consul's jitter; leave headroom.
            .timeout(LIST_WAIT * 2)
            .build()
            .map_err(|e| ExposeError::Kv(e.to_string()))?;
        Ok(Self { base, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

#[derive(serde::Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(serde::Deserialize)]
struct KvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

#[async_trait]
impl KvStore for ConsulStore {
    async fn create_session(&self, ttl: Duration) -> Result<String, ExposeError> {
        let body = serde_json::json!({
            "Name": "moor-exposer",
            "Behavior": "delete",
            "TTL": format!("{}s", ttl.as_secs()),
        });
        let created: SessionCreated = self
            .client
            .put(self.url("/v1/session/create"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ExposeError::Kv(e.to_string()))?
            .error_for_status()
            .map_err(|e| ExposeError::Kv(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExposeError::Kv(e.to_string()))?;
        Ok(created.id)
    }

    async fn renew_session(&self, session: &str) -> Result<(), ExposeError> {
        self.client
            .put(self.url(&format!("/v1/session/renew/{}", session)))
            .send()
            .await
            .map_err(|e| ExposeError::Kv(e.to_string()))?
            .error_for_status()
            .map_err(|e| ExposeError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        session: &str,
    ) -> Result<bool, ExposeError> {
        let acquired: bool = self
            .client
            .put(self.url(&format!("/v1/kv/{}?acquire={}", key, session)))
            .body(value)
            .send()
            .await
            .map_err(|e| ExposeError::Kv(e.to_string()))?
            .error_for_status()
            .map_err(|e| ExposeError::Kv(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExposeError::Kv(e.to_string()))?;
        Ok(acquired)
    }

    async fn delete(&self, key: &str) -> Result<(), ExposeError> {
        self.client
            .delete(self.url(&format!("/v1/kv/{}", key)))
            .send()
            .await
            .map_err(|e| ExposeError::Kv(e.to_string()))?
            .error_for_status()
            .map_err(|e| ExposeError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(Vec<(String, Vec<u8>)>, u64), ExposeError> {
        let url = self.url(&format!(
            "/v1/kv/{}?recurse=true&index={}&wait={}s",
            prefix,
            index,
            wait.as_secs()
        ));
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExposeError::Kv(e.to_string()))?;

        let new_index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(index);

        // 404 just means the prefix is empty.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok((Vec::new(), new_index));
        }
        let response =
            response.error_for_status().map_err(|e| ExposeError::Kv(e.to_string()))?;

        let pairs: Vec<KvPair> =
            response.json().await.map_err(|e| ExposeError::Kv(e.to_string()))?;
        let engine = base64::engine::general_purpose::STANDARD;
        let mut decoded = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let value = match pair.value {
                Some(encoded) => engine
                    .decode(encoded)
                    .map_err(|e| ExposeError::Kv(format!("bad base64 for {}: {}", pair.key, e)))?,
                None => Vec::new(),
            };
            decoded.push((pair.key, value));
        }
        Ok((decoded, new_index))
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory [`KvStore`] with consul-ish blocking semantics.

    use std::collections::{BTreeMap, HashSet};
    use std::sync::Arc;

    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MemoryState {
        next_session: u64,
        sessions: HashSet<String>,
        entries: BTreeMap<String, (Vec<u8>, String)>,
        index: u64,
        fail_writes: bool,
    }

    #[derive(Clone, Default)]
    pub struct MemoryKv {
        state: Arc<Mutex<MemoryState>>,
        changed: Arc<Notify>,
    }

    impl MemoryKv {
        pub fn new() -> Self {
            let kv = Self::default();
            kv.state.lock().index = 1;
            kv
        }

        pub fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.state.lock().entries.get(key).map(|(value, _)| value.clone())
        }

        pub fn session_of(&self, key: &str) -> Option<String> {
            self.state.lock().entries.get(key).map(|(_, session)| session.clone())
        }

        pub fn set_fail_writes(&self, fail: bool) {
            self.state.lock().fail_writes = fail;
        }

        /// Drop a session, as the agent does when the TTL lapses.
        pub fn invalidate_sessions(&self) {
            self.state.lock().sessions.clear();
        }
    }

    #[async_trait]
    impl KvStore for MemoryKv {
        async fn create_session(&self, _ttl: Duration) -> Result<String, ExposeError> {
            let mut state = self.state.lock();
            state.next_session += 1;
            let session = format!("session-{}", state.next_session);
            state.sessions.insert(session.clone());
            Ok(session)
        }

        async fn renew_session(&self, session: &str) -> Result<(), ExposeError> {
            if self.state.lock().sessions.contains(session) {
                Ok(())
            } else {
                Err(ExposeError::Kv(format!("session {} is gone", session)))
            }
        }

        async fn acquire(
            &self,
            key: &str,
            value: Vec<u8>,
            session: &str,
        ) -> Result<bool, ExposeError> {
            let mut state = self.state.lock();
            if state.fail_writes {
                return Err(ExposeError::Kv("injected write failure".to_string()));
            }
            if !state.sessions.contains(session) {
                return Ok(false);
            }
            state.entries.insert(key.to_string(), (value, session.to_string()));
            state.index += 1;
            drop(state);
            self.changed.notify_waiters();
            Ok(true)
        }

        async fn delete(&self, key: &str) -> Result<(), ExposeError> {
            let mut state = self.state.lock();
            if state.entries.remove(key).is_some() {
                state.index += 1;
                drop(state);
                self.changed.notify_waiters();
            }
            Ok(())
        }

        async fn list(
            &self,
            prefix: &str,
            index: u64,
            wait: Duration,
        ) -> Result<(Vec<(String, Vec<u8>)>, u64), ExposeError> {
            let snapshot = |state: &MemoryState| {
                let pairs = state
                    .entries
                    .range(prefix.to_string()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, (value, _))| (key.clone(), value.clone()))
                    .collect::<Vec<_>>();
                (pairs, state.index)
            };

            let deadline = tokio::time::sleep(wait);
            tokio::pin!(deadline);
            loop {
                let notified = self.changed.notified();
                {
                    let state = self.state.lock();
                    if state.index != index {
                        return Ok(snapshot(&state));
                    }
                }
                tokio::select! {
                    _ = notified => {}
                    _ = &mut deadline => {
                        let state = self.state.lock();
                        return Ok(snapshot(&state));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "consul_tests.rs"]
mod tests;
