// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scripted in-memory runtime for tests.
//!
//! Behavior is keyed by the image tag, mirroring the images the end-to-end
//! scenarios are written against:
//!
//! - `*:unknown`: the start fails, as an unpullable image would;
//! - `*:bad`: the container starts but never reports healthy;
//! - anything else: healthy on the first inspection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use moor_core::Spec;
use parking_lot::Mutex;

use crate::{ContainerRuntime, HealthStatus, RuntimeError, StartedContainer};

/// Record of one `start` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCall {
    pub workload: String,
    pub image: String,
    pub id: String,
}

#[derive(Default)]
struct FakeState {
    counter: u64,
    started: Vec<StartCall>,
    running: HashMap<String, String>,
    stopped: Vec<String>,
    digests: HashMap<String, String>,
}

/// In-memory [`ContainerRuntime`] double.
#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of containers currently considered running.
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().running.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every `start` call observed, in order.
    pub fn start_calls(&self) -> Vec<StartCall> {
        self.state.lock().started.clone()
    }

    /// Ids passed to `stop`, in order.
    pub fn stopped_ids(&self) -> Vec<String> {
        self.state.lock().stopped.clone()
    }

    /// Script the digest returned for an image.
    pub fn set_digest(&self, image: &str, digest: &str) {
        self.state.lock().digests.insert(image.to_string(), digest.to_string());
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, workload: &str, spec: &Spec) -> Result<StartedContainer, RuntimeError> {
        if spec.image.ends_with(":unknown") {
            return Err(RuntimeError::PullFailed {
                image: spec.image.clone(),
                reason: "manifest unknown".to_string(),
            });
        }

        let id = {
            let mut state = self.state.lock();
            state.counter += 1;
            let id = format!("fake-{}-{}", workload, state.counter);
            state.running.insert(id.clone(), spec.image.clone());
            state.started.push(StartCall {
                workload: workload.to_string(),
                image: spec.image.clone(),
                id: id.clone(),
            });
            id
        };

        Ok(StartedContainer { id, started_at: Utc::now(), network: None })
    }

    async fn stop(&self, container_id: &str, _stop_timeout: u64) {
        let mut state = self.state.lock();
        state.running.remove(container_id);
        state.stopped.push(container_id.to_string());
    }

    async fn inspect_health(&self, container_id: &str) -> Result<HealthStatus, RuntimeError> {
        let state = self.state.lock();
        match state.running.get(container_id) {
            None => Ok(HealthStatus::Gone),
            Some(image) if image.ends_with(":bad") => Ok(HealthStatus::Starting),
            Some(_) => Ok(HealthStatus::Healthy),
        }
    }

    async fn image_digest(&self, image: &str) -> Result<String, RuntimeError> {
        if image.ends_with(":unknown") {
            return Err(RuntimeError::PullFailed {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        let state = self.state.lock();
        Ok(state
            .digests
            .get(image)
            .cloned()
            .unwrap_or_else(|| format!("sha256:{}", image)))
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
