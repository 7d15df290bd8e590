// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Container runtime adapters for moor
//!
//! The [`ContainerRuntime`] trait is the seam between the per-workload
//! state machine and the container engine. The daemon drives it from
//! background tasks whose results funnel back into each instance's event
//! channel; nothing here touches instance state directly.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod auth;
mod docker;

#[cfg(any(test, feature = "test-support"))]
mod fake;

pub use auth::RegistryAuth;
pub use docker::DockerRuntime;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeRuntime, StartCall};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moor_core::Spec;
use thiserror::Error;

/// Errors from runtime operations.
///
/// All of these are transient from the state machine's point of view: a
/// failed start schedules a retry, a failed inspect is retried on the next
/// poll tick, and stop errors are logged and ignored.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("image pull failed for {image}: {reason}")]
    PullFailed { image: String, reason: String },

    #[error("container create failed: {0}")]
    CreateFailed(String),

    #[error("container start failed: {0}")]
    StartFailed(String),

    #[error("container inspect failed: {0}")]
    InspectFailed(String),

    #[error("container config rejected: {0}")]
    BadConfig(String),

    #[error("docker client error: {0}")]
    Client(String),
}

/// Result of a successful container start.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedContainer {
    /// Runtime identifier.
    pub id: String,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    /// Networking details from the post-start inspect.
    pub network: Option<serde_json::Value>,
}

/// Health verdict from a single inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The runtime reports `healthy`, or `running` with no healthcheck.
    Healthy,
    /// Healthcheck configured but no verdict yet.
    Starting,
    /// The runtime reports the container unhealthy or not running.
    Unhealthy,
    /// The container no longer exists.
    Gone,
}

/// Seam between instances and the container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Pull the image, remove any container holding the target name, then
    /// create, start, and inspect a fresh container for `spec`.
    ///
    /// The container name is `{workload}_{random suffix}` unless the spec
    /// pins one.
    async fn start(&self, workload: &str, spec: &Spec) -> Result<StartedContainer, RuntimeError>;

    /// Gracefully stop a container, waiting up to `stop_timeout` seconds.
    ///
    /// Best-effort: failures are logged, never surfaced. The state machine
    /// advances regardless of a container that refuses to die.
    async fn stop(&self, container_id: &str, stop_timeout: u64);

    /// One health inspection of a running container.
    async fn inspect_health(&self, container_id: &str) -> Result<HealthStatus, RuntimeError>;

    /// Pull `image` and return its current digest (for image watching).
    async fn image_digest(&self, image: &str) -> Result<String, RuntimeError>;
}
