// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local state aggregation.
//!
//! A single actor owns the `name → snapshot` map and the set of reader
//! streams, so every reader observes a prefix of one global update
//! sequence. Producers are per-instance forwarder tasks; readers get the
//! full map as one frame per change (the shape the stream API and the
//! gossip merge both rely on).

use std::collections::HashMap;

use moor_core::Snapshot;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::supervisor::{InstanceBirth, Supervisor};

/// One full-map frame, emitted after every change.
pub type StateFrame = HashMap<String, Snapshot>;

const FRAMES_QUEUE: usize = 64;
const UPDATES_QUEUE: usize = 64;

enum Control {
    Read(oneshot::Sender<StateFrame>),
    Subscribe(oneshot::Sender<(StateFrame, broadcast::Receiver<StateFrame>)>),
}

enum Update {
    Snapshot(String, Snapshot),
    Closed(String),
}

/// Handle to the aggregation actor. Cheap to clone.
#[derive(Clone)]
pub struct StateManager {
    control: mpsc::Sender<Control>,
}

impl StateManager {
    /// Spawn the actor, subscribed to the supervisor's instance births.
    pub fn new(supervisor: &Supervisor, cancel: CancellationToken) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        let births = supervisor.subscribe();
        tokio::spawn(actor(births, control_rx, cancel));
        Self { control: control_tx }
    }

    /// Atomic copy of the current map. Never blocks producers.
    pub async fn read_current(&self) -> StateFrame {
        let (reply, response) = oneshot::channel();
        if self.control.send(Control::Read(reply)).await.is_err() {
            return StateFrame::new();
        }
        response.await.unwrap_or_default()
    }

    /// Current map plus a stream of one frame per subsequent change.
    pub async fn subscribe(&self) -> Option<(StateFrame, broadcast::Receiver<StateFrame>)> {
        let (reply, response) = oneshot::channel();
        self.control.send(Control::Subscribe(reply)).await.ok()?;
        response.await.ok()
    }
}

async fn actor(
    mut births: mpsc::Receiver<InstanceBirth>,
    mut control: mpsc::Receiver<Control>,
    cancel: CancellationToken,
) {
    let mut current = StateFrame::new();
    let (frames, _) = broadcast::channel(FRAMES_QUEUE);
    let (updates_tx, mut updates) = mpsc::channel::<Update>(UPDATES_QUEUE);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(birth) = births.recv() => {
                current.insert(birth.instance.name.clone(), Snapshot::Init);
                spawn_forwarder(birth, updates_tx.clone());
            },

            Some(update) = updates.recv() => {
                match update {
                    Update::Snapshot(name, snapshot) => {
                        current.insert(name, snapshot);
                    }
                    Update::Closed(name) => {
                        current.remove(&name);
                    }
                }
                let _ = frames.send(current.clone());
            }

            request = control.recv() => match request {
                Some(Control::Read(reply)) => {
                    let _ = reply.send(current.clone());
                }
                Some(Control::Subscribe(reply)) => {
                    let _ = reply.send((current.clone(), frames.subscribe()));
                }
                None => break,
            },
        }
    }
}

fn spawn_forwarder(birth: InstanceBirth, updates: mpsc::Sender<Update>) {
    let mut snapshots = birth.snapshots;
    let name = birth.instance.name.clone();
    tokio::spawn(async move {
        loop {
            match snapshots.recv().await {
                Ok(snapshot) => {
                    if updates.send(Update::Snapshot(name.clone(), snapshot)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(instance = %name, missed, "state forwarder lagged, skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = updates.send(Update::Closed(name)).await;
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
