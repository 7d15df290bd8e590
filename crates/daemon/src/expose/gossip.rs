// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Gossip-backed exposer.
//!
//! Each host joins a SWIM-style membership ring (chitchat) and advertises
//! its local API endpoint in node metadata. Aggregation is pull-based: for
//! every live peer a worker holds a WebSocket into that peer's
//! `/v1/state-stream` and merges the full-map frames into one cluster
//! view. The worker population is reference-counted: peers are only
//! dialed while someone is actually watching the cluster view.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use async_trait::async_trait;

use super::{ExposeError, ExposedInstance, Exposer};

const CLUSTER_ID: &str = "moor";
const GOSSIP_INTERVAL: Duration = Duration::from_secs(1);
const MEMBERSHIP_POLL: Duration = Duration::from_secs(2);
const REDIAL_BACKOFF: Duration = Duration::from_secs(10);
const DELETION_GRACE: Duration = Duration::from_secs(60);

/// Settings for joining the gossip ring.
pub struct GossipConfig {
    /// This host's name in cluster views (and its node id in the ring).
    pub host_id: String,
    /// Seed addresses of peers to join through.
    pub connects: Vec<String>,
    /// UDP address the gossip transport binds to.
    pub bind_addr: SocketAddr,
    /// UDP address advertised to peers.
    pub advertise_addr: SocketAddr,
    /// API host advertised to peers for state-stream dials.
    pub api_addr: String,
    /// API port advertised to peers.
    pub api_port: u16,
}

/// Merged per-peer state plus the wakeup for cluster-view subscribers.
#[derive(Default)]
pub(crate) struct ClusterState {
    dict: Mutex<HashMap<String, HashMap<String, serde_json::Value>>>,
    changed: Notify,
}

impl ClusterState {
    pub(crate) fn merge(&self, host: &str, services: HashMap<String, serde_json::Value>) {
        self.dict.lock().insert(host.to_string(), services);
        self.changed.notify_waiters();
    }

    pub(crate) fn remove(&self, host: &str) {
        if self.dict.lock().remove(host).is_some() {
            self.changed.notify_waiters();
        }
    }

    pub(crate) fn flatten(&self) -> Vec<ExposedInstance> {
        let dict = self.dict.lock();
        let mut records = Vec::new();
        for (host, services) in dict.iter() {
            for (service, snapshot) in services {
                records.push(ExposedInstance {
                    host: host.clone(),
                    service: service.clone(),
                    snapshot: snapshot.clone(),
                });
            }
        }
        records
    }
}

struct WorkerRef {
    clients: usize,
    cancel: Option<CancellationToken>,
}

struct GossipInner {
    host_id: String,
    state: ClusterState,
    worker: Mutex<WorkerRef>,
    chitchat: Arc<tokio::sync::Mutex<Chitchat>>,
    // Keeps the gossip transport alive for the daemon's lifetime.
    _handle: ChitchatHandle,
}

/// Exposer aggregating peer state over gossip membership + WebSockets.
pub struct GossipExposer {
    inner: Arc<GossipInner>,
}

impl GossipExposer {
    /// Join the ring and start advertising this host's API endpoint.
    pub async fn new(config: GossipConfig) -> Result<Self, ExposeError> {
        let chitchat_id = ChitchatId::new(config.host_id.clone(), 0, config.advertise_addr);
        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: CLUSTER_ID.to_string(),
            gossip_interval: GOSSIP_INTERVAL,
            listen_addr: config.bind_addr,
            seed_nodes: config.connects.clone(),
            failure_detector_config: FailureDetectorConfig::default(),
            marked_for_deletion_grace_period: DELETION_GRACE,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };
        let initial_meta = vec![
            ("api_addr".to_string(), config.api_addr.clone()),
            ("api_port".to_string(), config.api_port.to_string()),
        ];
        let handle = spawn_chitchat(chitchat_config, initial_meta, &UdpTransport)
            .await
            .map_err(|e| ExposeError::Gossip(e.to_string()))?;
        let chitchat = handle.chitchat();

        Ok(Self {
            inner: Arc::new(GossipInner {
                host_id: config.host_id,
                state: ClusterState::default(),
                worker: Mutex::new(WorkerRef { clients: 0, cancel: None }),
                chitchat,
                _handle: handle,
            }),
        })
    }
}

impl GossipInner {
    fn client_added(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        worker.clients += 1;
        if worker.clients == 1 {
            let cancel = CancellationToken::new();
            worker.cancel = Some(cancel.clone());
            tokio::spawn(peer_manager(self.clone(), cancel));
        }
    }

    fn client_removed(&self) {
        let mut worker = self.worker.lock();
        worker.clients = worker.clients.saturating_sub(1);
        if worker.clients == 0 {
            if let Some(cancel) = worker.cancel.take() {
                cancel.cancel();
            }
        }
    }
}

#[async_trait]
impl Exposer for GossipExposer {
    async fn save_state(&self, _record: ExposedInstance) {
        // Peers pull local state through the API's state-stream; there is
        // nothing to push.
    }

    fn receive_states(&self, cancel: CancellationToken) -> mpsc::Receiver<Vec<ExposedInstance>> {
        let (tx, rx) = mpsc::channel(4);
        let inner = self.inner.clone();
        inner.client_added();
        tokio::spawn(async move {
            loop {
                let notified = inner.state.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let records = inner.state.flatten();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(records) => if sent.is_err() { break },
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut notified => {}
                }
            }
            inner.client_removed();
        });
        rx
    }
}

struct PeerEndpoint {
    host: String,
    endpoint: String,
}

/// Track ring membership and keep one stream task per live peer.
async fn peer_manager(inner: Arc<GossipInner>, cancel: CancellationToken) {
    let mut streams: HashMap<String, CancellationToken> = HashMap::new();

    loop {
        let live = live_peers(&inner).await;
        let live_hosts: HashSet<&String> = live.iter().map(|peer| &peer.host).collect();

        let departed: Vec<String> =
            streams.keys().filter(|host| !live_hosts.contains(host)).cloned().collect();
        for host in departed {
            debug!(peer = %host, "peer left the ring");
            if let Some(peer_cancel) = streams.remove(&host) {
                peer_cancel.cancel();
            }
            inner.state.remove(&host);
        }

        for peer in live {
            if streams.contains_key(&peer.host) {
                continue;
            }
            debug!(peer = %peer.host, endpoint = %peer.endpoint, "peer joined the ring");
            let peer_cancel = cancel.child_token();
            streams.insert(peer.host.clone(), peer_cancel.clone());
            tokio::spawn(peer_stream(inner.clone(), peer, peer_cancel));
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(MEMBERSHIP_POLL) => {}
        }
    }

    for (_, peer_cancel) in streams {
        peer_cancel.cancel();
    }
}

async fn live_peers(inner: &GossipInner) -> Vec<PeerEndpoint> {
    let guard = inner.chitchat.lock().await;
    let mut peers = Vec::new();
    for id in guard.live_nodes() {
        if id.node_id == inner.host_id {
            continue;
        }
        let Some(node_state) = guard.node_state(id) else {
            continue;
        };
        let Some(api_port) = node_state.get("api_port").and_then(|p| p.parse::<u16>().ok())
        else {
            warn!(peer = %id.node_id, "peer advertises no api port, skipped");
            continue;
        };
        let api_addr = match node_state.get("api_addr") {
            Some(addr) if !addr.is_empty() => addr.to_string(),
            _ => id.gossip_advertise_addr.ip().to_string(),
        };
        peers.push(PeerEndpoint {
            host: id.node_id.clone(),
            endpoint: format!("ws://{}:{}/v1/state-stream", api_addr, api_port),
        });
    }
    peers
}

/// Hold a WebSocket into one peer's state-stream and merge its frames.
/// Connection losses drop the peer's contribution and redial with backoff.
async fn peer_stream(inner: Arc<GossipInner>, peer: PeerEndpoint, cancel: CancellationToken) {
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            connected = tokio_tungstenite::connect_async(peer.endpoint.as_str()) => connected,
        };
        let socket = match connected {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!(endpoint = %peer.endpoint, error = %e, "can't connect to peer");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(REDIAL_BACKOFF) => continue,
                }
            }
        };

        let (_, mut frames) = socket.split();
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return,
                message = frames.next() => message,
            };
            match message {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    match serde_json::from_str::<HashMap<String, serde_json::Value>>(text.as_str())
                    {
                        Ok(services) => inner.state.merge(&peer.host, services),
                        Err(e) => {
                            warn!(endpoint = %peer.endpoint, error = %e, "can't parse state frame")
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(endpoint = %peer.endpoint, error = %e, "can't read from peer stream");
                    inner.state.remove(&peer.host);
                    break;
                }
                None => {
                    inner.state.remove(&peer.host);
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(REDIAL_BACKOFF) => {}
        }
    }
}

#[cfg(test)]
#[path = "gossip_tests.rs"]
mod tests;
