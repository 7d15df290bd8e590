// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Owned container handle.
//!
//! A [`Container`] couples the serializable [`ContainerInfo`] with the
//! background tasks watching the real container: the health poller and,
//! when the spec asks for it, the image watcher. The handle lives in
//! exactly one state field at a time; stopping it cancels the tasks and
//! issues a best-effort runtime stop.

use std::time::Duration;

use chrono::Utc;
use moor_core::{ContainerInfo, Event, Spec};
use moor_runtime::{HealthStatus, RuntimeError};
use tracing::{debug, warn};

use super::InstanceCtx;

const HEALTH_POLL: Duration = Duration::from_secs(2);
const IMAGE_WATCH_POLL: Duration = Duration::from_secs(60);

pub(crate) struct Container {
    pub info: ContainerInfo,
    tasks: tokio_util::sync::CancellationToken,
}

impl Container {
    /// Start a container for `spec` and spawn its watchers.
    pub(crate) async fn start(ctx: &InstanceCtx, spec: &Spec) -> Result<Container, RuntimeError> {
        let started = ctx.runtime.start(&ctx.name, spec).await?;
        let container = Container {
            info: ContainerInfo {
                id: started.id,
                spec: spec.clone(),
                started_at: started.started_at,
                stable_at: None,
                image: spec.image.clone(),
                network: started.network,
            },
            tasks: ctx.tasks.child_token(),
        };
        container.spawn_health_poller(ctx);
        if spec.watch_image {
            container.spawn_image_watcher(ctx);
        }
        Ok(container)
    }

    /// Mark the moment the first healthy verdict arrived.
    pub(crate) fn stabilized(mut self) -> Self {
        self.info.stable_at = Some(Utc::now());
        self
    }

    /// Cancel watcher tasks and stop the runtime container. Best-effort:
    /// the state machine advances whatever the runtime says.
    pub(crate) async fn stop(&self, ctx: &InstanceCtx) {
        self.tasks.cancel();
        ctx.runtime.stop(&self.info.id, self.info.spec.stop_timeout).await;
    }

    /// Poll health at 2 s until a verdict: `Healthy` as soon as the runtime
    /// reports it, `Unhealthy` once `health_timeout` elapses. One verdict
    /// per poller; `Wait` respawns it to keep waiting on an unhealthy
    /// container.
    pub(crate) fn spawn_health_poller(&self, ctx: &InstanceCtx) {
        let id = self.info.id.clone();
        let timeout = Duration::from_secs(self.info.spec.health_timeout);
        let runtime = ctx.runtime.clone();
        let events = ctx.events.clone();
        let cancel = self.tasks.clone();
        let instance = ctx.name.clone();

        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            let verdict = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(HEALTH_POLL) => {}
                }
                if tokio::time::Instant::now() >= deadline {
                    break Event::Unhealthy { container_id: id.clone() };
                }
                match runtime.inspect_health(&id).await {
                    Ok(HealthStatus::Healthy) => break Event::Healthy { container_id: id.clone() },
                    Ok(status) => {
                        debug!(instance = %instance, container = %id, status = ?status, "healthcheck tick");
                    }
                    Err(e) => {
                        warn!(instance = %instance, container = %id, error = %e, "error while container inspecting");
                    }
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = events.send(verdict) => {}
            }
        });
    }

    /// Re-pull the image periodically; on digest change, replay the current
    /// spec as a synthetic `NewSpec` and exit. The restart that follows
    /// mints a fresh watcher.
    fn spawn_image_watcher(&self, ctx: &InstanceCtx) {
        let image = self.info.spec.image.clone();
        let spec = self.info.spec.clone();
        let runtime = ctx.runtime.clone();
        let events = ctx.events.clone();
        let cancel = self.tasks.clone();
        let instance = ctx.name.clone();

        tokio::spawn(async move {
            let mut known: Option<String> = None;
            loop {
                match runtime.image_digest(&image).await {
                    Ok(digest) => match &known {
                        None => known = Some(digest),
                        Some(prev) if *prev != digest => {
                            debug!(instance = %instance, %image, "image digest changed, restarting workload");
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = events.send(Event::NewSpec(spec)) => {}
                            }
                            return;
                        }
                        Some(_) => {}
                    },
                    Err(e) => {
                        warn!(instance = %instance, %image, error = %e, "image watch pull failed");
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(IMAGE_WATCH_POLL) => {}
                }
            }
        });
    }
}
