// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workload-set membership.
//!
//! The supervisor mirrors the spec directory: one instance per workload
//! name, created on appearance and stopped on disappearance. Births are
//! delivered to subscribers *before* the instance starts, each carrying a
//! snapshot receiver opened ahead of the first emission, so an observer
//! never misses the head of the stream.

use std::collections::HashMap;
use std::sync::Arc;

use moor_core::Snapshot;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::instance::Instance;
use crate::provider::WatchEvent;
use crate::system::System;

const BIRTHS_QUEUE: usize = 16;

/// A newly supervised instance, published before its start.
pub struct InstanceBirth {
    pub instance: Arc<Instance>,
    /// Snapshot stream subscribed before the instance started: observes
    /// every emission from the first one on.
    pub snapshots: broadcast::Receiver<Snapshot>,
}

pub struct Supervisor {
    system: Arc<System>,
    instances: Mutex<HashMap<String, Arc<Instance>>>,
    birth_subs: Mutex<Vec<mpsc::Sender<InstanceBirth>>>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(system: Arc<System>) -> Arc<Self> {
        Arc::new(Self {
            cancel: system.cancel.child_token(),
            system,
            instances: Mutex::new(HashMap::new()),
            birth_subs: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        })
    }

    /// Subscribe to instance births. Only instances appearing after the
    /// subscription are delivered.
    pub fn subscribe(&self) -> mpsc::Receiver<InstanceBirth> {
        let (tx, rx) = mpsc::channel(BIRTHS_QUEUE);
        self.birth_subs.lock().push(tx);
        rx
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    /// Start mirroring the spec directory.
    pub fn start(self: &Arc<Self>) {
        let supervisor = self.clone();
        let mut events = self.system.specs.watch_specs(self.cancel.child_token());
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    WatchEvent::Appeared(name) => supervisor.appeared(name).await,
                    WatchEvent::Disappeared(name) => supervisor.disappeared(&name).await,
                }
            }
        });
        *self.watcher.lock() = Some(handle);
    }

    async fn appeared(&self, name: String) {
        info!(workload = %name, "spec appeared");
        let instance = Arc::new(Instance::new(&self.system, name.clone()));
        self.instances.lock().insert(name, instance.clone());

        // Publish first: every subscriber gets its snapshot receiver while
        // the instance is still inert.
        let subscribers = self.birth_subs.lock().clone();
        let mut pruned = false;
        for subscriber in &subscribers {
            let birth = InstanceBirth {
                instance: instance.clone(),
                snapshots: instance.subscribe(),
            };
            if subscriber.send(birth).await.is_err() {
                pruned = true;
            }
        }
        if pruned {
            self.birth_subs.lock().retain(|subscriber| !subscriber.is_closed());
        }

        instance.start();
    }

    async fn disappeared(&self, name: &str) {
        info!(workload = %name, "spec disappeared");
        let instance = self.instances.lock().get(name).cloned();
        match instance {
            Some(instance) => {
                instance.stop().await;
                self.instances.lock().remove(name);
            }
            None => warn!(workload = %name, "disappeared workload was not supervised"),
        }
    }

    /// Cancel the watcher, then stop every remaining instance.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }
        let drained: Vec<Arc<Instance>> = {
            let mut instances = self.instances.lock();
            instances.drain().map(|(_, instance)| instance).collect()
        };
        for instance in drained {
            instance.stop().await;
        }
        self.birth_subs.lock().clear();
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
