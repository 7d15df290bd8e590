// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-workload instance.
//!
//! One instance owns one workload: a bounded event channel with a single
//! consumer loop applying transitions atomically, and a set of background
//! producers (spec reader, health pollers, image watchers, retry and deploy
//! timers) holding a send half plus a cancellation token. Snapshots fan out
//! over a broadcast channel; a subscriber that falls behind skips ahead
//! with a logged warning.

mod container;
mod states;

pub(crate) use container::Container;
use states::State;

use std::sync::Arc;
use std::time::Duration;

use moor_core::{Event, Snapshot, Spec};
use moor_runtime::ContainerRuntime;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::system::System;

const EVENT_QUEUE: usize = 16;
const SNAPSHOT_QUEUE: usize = 64;
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Shared context handed to transitions and background producers.
pub(crate) struct InstanceCtx {
    pub name: String,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub events: mpsc::Sender<Event>,
    pub tasks: CancellationToken,
}

impl InstanceCtx {
    pub(crate) async fn start_or_try_again(&self, spec: Spec) -> State {
        match Container::start(self, &spec).await {
            Ok(container) => State::Wait { container },
            Err(e) => {
                warn!(instance = %self.name, error = %e, "can't start container, will try again later");
                State::TryAgain { retry_id: self.schedule_try(), spec }
            }
        }
    }

    pub(crate) async fn start_or_try_again_next(&self, current: Container, spec: Spec) -> State {
        match Container::start(self, &spec).await {
            Ok(next) => State::WaitNext { current, next },
            Err(e) => {
                warn!(instance = %self.name, error = %e, "can't start container, will try again later");
                State::TryAgainNext { current, retry_id: self.schedule_try(), spec }
            }
        }
    }

    /// Schedule a `Try` event and return its token. A transition that
    /// replaces the pending retry simply expects a different token, so the
    /// superseded timer fires into nothing.
    pub(crate) fn schedule_try(&self) -> Uuid {
        self.schedule(RETRY_DELAY, |id| Event::Try { id })
    }

    /// Schedule a `DeployCompleted` event after the rollover grace window.
    pub(crate) fn schedule_deploy_completed(&self, grace: Duration) -> Uuid {
        self.schedule(grace, |id| Event::DeployCompleted { id })
    }

    fn schedule(&self, delay: Duration, make: impl FnOnce(Uuid) -> Event + Send + 'static) -> Uuid {
        let id = Uuid::new_v4();
        let events = self.events.clone();
        let cancel = self.tasks.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = events.send(make(id)) => {}
            }
        });
        id
    }
}

/// One supervised workload.
pub struct Instance {
    pub name: String,
    system: Arc<System>,
    events: mpsc::Sender<Event>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    snapshots: Mutex<Option<broadcast::Sender<Snapshot>>>,
    tasks: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Instance {
    pub fn new(system: &Arc<System>, name: impl Into<String>) -> Self {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (snapshots, _) = broadcast::channel(SNAPSHOT_QUEUE);
        Self {
            name: name.into(),
            system: system.clone(),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            snapshots: Mutex::new(Some(snapshots)),
            tasks: system.cancel.child_token(),
            loop_handle: Mutex::new(None),
        }
    }

    /// Subscribe to the snapshot stream. Subscribers added before `start`
    /// observe every emission; the stream closes after `Stopped`.
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        match self.snapshots.lock().as_ref() {
            Some(snapshots) => snapshots.subscribe(),
            None => {
                // Already stopped: hand back a stream that is closed from
                // the start.
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                receiver
            }
        }
    }

    /// Spawn the spec reader and the event loop.
    pub fn start(&self) {
        let Some(mut events_rx) = self.events_rx.lock().take() else {
            warn!(instance = %self.name, "instance already started");
            return;
        };

        let mut specs = self.system.specs.receive_specs(&self.name, self.tasks.child_token());
        let events = self.events.clone();
        let cancel = self.tasks.clone();
        tokio::spawn(async move {
            while let Some(spec) = specs.recv().await {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = events.send(Event::NewSpec(spec)) => if res.is_err() { return },
                }
            }
        });

        let ctx = InstanceCtx {
            name: self.name.clone(),
            runtime: self.system.runtime.clone(),
            events: self.events.clone(),
            tasks: self.tasks.clone(),
        };
        let Some(snapshots) = self.snapshots.lock().clone() else {
            return;
        };
        let handle = tokio::spawn(async move {
            let mut state = State::Init;
            while let Some(event) = events_rx.recv().await {
                info!(instance = %ctx.name, event = event.name(), "new event");
                let (next, publish) = state.apply(&ctx, event).await;
                state = next;
                if publish {
                    let snapshot = state.snapshot();
                    info!(instance = %ctx.name, state = %snapshot, "updated state");
                    let _ = snapshots.send(snapshot);
                }
                if matches!(state, State::Stopped) {
                    break;
                }
            }
            // Drain stragglers so blocked producers can release their send
            // halves, then let the snapshot stream close.
            events_rx.close();
            while events_rx.try_recv().is_ok() {}
        });
        *self.loop_handle.lock() = Some(handle);
    }

    /// Stop every owned container, wait for the event loop to finish, and
    /// close the snapshot stream.
    pub async fn stop(&self) {
        let _ = self.events.send(Event::Stop).await;
        self.tasks.cancel();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // Subscribers consume the buffered `Stopped`, then see the stream
        // close.
        drop(self.snapshots.lock().take());
    }
}

#[cfg(test)]
#[path = "instance_tests.rs"]
mod tests;
