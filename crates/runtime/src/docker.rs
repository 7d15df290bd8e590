// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Docker-backed [`ContainerRuntime`] built on bollard.
//!
//! `start` follows the engine's deploy choreography: pull (with registry
//! credentials picked by image prefix), force-remove any name collision,
//! create with the spec's opaque container config, start, inspect for
//! networking info.

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::models::{ContainerCreateBody, HealthStatusEnum};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::Docker;
use chrono::Utc;
use futures_util::StreamExt;
use moor_core::Spec;
use tracing::{debug, info, warn};

use crate::{ContainerRuntime, HealthStatus, RegistryAuth, RuntimeError, StartedContainer};

/// Length of the random container-name suffix.
const NAME_SUFFIX_LEN: usize = 10;

pub struct DockerRuntime {
    client: Docker,
    auths: Vec<RegistryAuth>,
}

impl DockerRuntime {
    /// Connect using the runtime's usual environment (`DOCKER_HOST` etc.).
    pub fn new(auths: Vec<RegistryAuth>) -> Result<Self, RuntimeError> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Client(e.to_string()))?;
        Ok(Self { client, auths })
    }

    fn credentials(&self, image: &str) -> Option<DockerCredentials> {
        RegistryAuth::select(&self.auths, image).map(|auth| DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            ..Default::default()
        })
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let credentials = self.credentials(image);
        info!(image, authenticated = credentials.is_some(), "image pull");

        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        let mut progress = self.client.create_image(Some(options), None, credentials);
        while let Some(step) = progress.next().await {
            step.map_err(|e| RuntimeError::PullFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }

        info!(image, "image pulled");
        Ok(())
    }

    fn create_body(&self, spec: &Spec) -> Result<ContainerCreateBody, RuntimeError> {
        serde_json::from_value(spec.container_body())
            .map_err(|e| RuntimeError::BadConfig(e.to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, workload: &str, spec: &Spec) -> Result<StartedContainer, RuntimeError> {
        self.pull(&spec.image).await?;

        let name = match &spec.name {
            Some(fixed) => fixed.clone(),
            None => format!("{}_{}", workload, nanoid::nanoid!(NAME_SUFFIX_LEN)),
        };

        // A previous daemon run may have left a container behind under the
        // same name; the new one always wins.
        let remove = RemoveContainerOptionsBuilder::default().force(true).build();
        if let Err(e) = self.client.remove_container(&name, Some(remove)).await {
            debug!(container = %name, error = %e, "no colliding container removed");
        }

        let body = self.create_body(spec)?;
        let create = CreateContainerOptionsBuilder::default().name(&name).build();
        let created = self
            .client
            .create_container(Some(create), body)
            .await
            .map_err(|e| RuntimeError::CreateFailed(e.to_string()))?;
        info!(workload, id = %created.id, "container created");

        self.client
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| RuntimeError::StartFailed(e.to_string()))?;
        info!(workload, id = %created.id, "container started");

        let inspected = self
            .client
            .inspect_container(&created.id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RuntimeError::InspectFailed(e.to_string()))?;
        let network = inspected
            .network_settings
            .and_then(|settings| serde_json::to_value(settings).ok());

        Ok(StartedContainer { id: created.id, started_at: Utc::now(), network })
    }

    async fn stop(&self, container_id: &str, stop_timeout: u64) {
        info!(id = container_id, "stop container");
        let options = StopContainerOptionsBuilder::default().t(stop_timeout as i32).build();
        if let Err(e) = self.client.stop_container(container_id, Some(options)).await {
            warn!(id = container_id, error = %e, "error while container stop");
        }
    }

    async fn inspect_health(&self, container_id: &str) -> Result<HealthStatus, RuntimeError> {
        let inspected = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RuntimeError::InspectFailed(e.to_string()))?;

        let Some(state) = inspected.state else {
            return Ok(HealthStatus::Gone);
        };
        let running = state.running.unwrap_or(false);
        let health = state.health.and_then(|h| h.status);

        debug!(id = container_id, running, health = ?health, "healthcheck tick");

        Ok(match health {
            Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
            Some(HealthStatusEnum::STARTING) => HealthStatus::Starting,
            Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
            // No healthcheck configured: a running container counts as healthy.
            Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None => {
                if running {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                }
            }
        })
    }

    async fn image_digest(&self, image: &str) -> Result<String, RuntimeError> {
        self.pull(image).await?;
        let inspected = self
            .client
            .inspect_image(image)
            .await
            .map_err(|e| RuntimeError::InspectFailed(e.to_string()))?;
        inspected
            .id
            .ok_or_else(|| RuntimeError::InspectFailed(format!("image {} has no id", image)))
    }
}
