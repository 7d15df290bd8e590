// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cluster-wide state exposure.
//!
//! An [`Exposer`] replicates local snapshots somewhere other hosts can see
//! them and serves the aggregated view back. The driver sits behind each
//! instance's snapshot subscription, so a slow exposer can never block a
//! state machine; at worst its watcher lags and skips ahead.

pub mod consul;
pub mod gossip;

use async_trait::async_trait;
use moor_core::Snapshot;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::supervisor::Supervisor;

/// One workload's state as seen from the cluster.
///
/// Field names are the wire contract shared by every host in the cluster
/// view: `Condo` is the publishing host, `Service` the workload name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposedInstance {
    #[serde(rename = "Condo")]
    pub host: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Snapshot")]
    pub snapshot: serde_json::Value,
}

impl ExposedInstance {
    pub fn new(host: &str, service: &str, snapshot: &Snapshot) -> Self {
        Self {
            host: host.to_string(),
            service: service.to_string(),
            snapshot: serde_json::to_value(snapshot).unwrap_or_default(),
        }
    }

    /// Whether the replicated snapshot is terminal.
    pub fn is_stopped(&self) -> bool {
        self.snapshot.get("State").and_then(|s| s.as_str()) == Some("Stopped")
    }

    /// Typed view of the replicated snapshot, when the shape is known.
    pub fn decode(&self) -> Option<Snapshot> {
        serde_json::from_value(self.snapshot.clone()).ok()
    }
}

/// Exposer failures are retried forever with backoff; they never reach the
/// state machines.
#[derive(Debug, Error)]
pub enum ExposeError {
    #[error("kv request failed: {0}")]
    Kv(String),

    #[error("gossip failure: {0}")]
    Gossip(String),
}

/// Pluggable replication backend.
#[async_trait]
pub trait Exposer: Send + Sync {
    /// Record one local state change. Must not block the caller beyond a
    /// bounded enqueue.
    async fn save_state(&self, record: ExposedInstance);

    /// Stream of aggregated cluster views; a fresh `Vec` per change.
    fn receive_states(&self, cancel: CancellationToken) -> mpsc::Receiver<Vec<ExposedInstance>>;
}

/// Pipe every instance's snapshots into the exposer, tagged with this
/// host's id.
pub fn spawn_driver(
    supervisor: &Supervisor,
    exposer: std::sync::Arc<dyn Exposer>,
    host: String,
    cancel: CancellationToken,
) {
    let mut births = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            let birth = tokio::select! {
                _ = cancel.cancelled() => return,
                birth = births.recv() => match birth {
                    Some(birth) => birth,
                    None => return,
                },
            };

            let mut snapshots = birth.snapshots;
            let exposer = exposer.clone();
            let host = host.clone();
            let name = birth.instance.name.clone();
            tokio::spawn(async move {
                loop {
                    match snapshots.recv().await {
                        Ok(snapshot) => {
                            exposer.save_state(ExposedInstance::new(&host, &name, &snapshot)).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(instance = %name, missed, "expose watcher lagged, skipping ahead");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            });
        }
    });
}
