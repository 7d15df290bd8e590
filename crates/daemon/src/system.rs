// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! System scope and daemon assembly.
//!
//! [`System`] carries everything a component may need (the container
//! runtime, the spec provider, the host id, the root cancellation token)
//! so nothing in the daemon reaches for process-wide state. [`Daemon`]
//! wires the full stack together for the `start` command and for the
//! end-to-end tests.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use moor_runtime::ContainerRuntime;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{self, ApiContext, ApiError};
use crate::expose::{spawn_driver, Exposer};
use crate::provider::DirectorySpecs;
use crate::state::StateManager;
use crate::supervisor::Supervisor;

/// Shared dependencies scoped to one daemon run.
pub struct System {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub specs: DirectorySpecs,
    pub host_id: String,
    pub cancel: CancellationToken,
}

impl System {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        directory: impl Into<PathBuf>,
        host_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            specs: DirectorySpecs::new(directory),
            host_id: host_id.into(),
            cancel: CancellationToken::new(),
        })
    }
}

/// Daemon configuration assembled by the CLI.
pub struct DaemonConfig {
    /// Directory of workload specs.
    pub directory: PathBuf,
    /// Local API listen address; `None` disables the HTTP surface.
    pub listen: Option<SocketAddr>,
    /// This host's name in cluster views.
    pub host_id: String,
    /// Optional state exposer (consul or gossip).
    pub exposer: Option<Arc<dyn Exposer>>,
}

/// Fatal startup errors. Everything past startup is absorbed at a
/// component boundary instead.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("spec directory {0}: {1}")]
    BadDirectory(PathBuf, std::io::Error),

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A running daemon: supervisor, state manager, optional API and exposer.
pub struct Daemon {
    pub system: Arc<System>,
    pub supervisor: Arc<Supervisor>,
    pub state: StateManager,
    /// Bound API address, when the HTTP surface is enabled.
    pub api_addr: Option<SocketAddr>,
    api_task: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Validate configuration, bind the API, and start supervising.
    pub async fn start(
        runtime: Arc<dyn ContainerRuntime>,
        config: DaemonConfig,
    ) -> Result<Daemon, StartError> {
        let meta = tokio::fs::metadata(&config.directory)
            .await
            .map_err(|e| StartError::BadDirectory(config.directory.clone(), e))?;
        if !meta.is_dir() {
            return Err(StartError::NotADirectory(config.directory));
        }

        let system = System::new(runtime, &config.directory, config.host_id);
        let supervisor = Supervisor::new(system.clone());
        let state = StateManager::new(&supervisor, system.cancel.child_token());

        if let Some(exposer) = config.exposer.clone() {
            spawn_driver(&supervisor, exposer, system.host_id.clone(), system.cancel.child_token());
        }

        // Bind before starting the supervisor: a busy port is fatal and
        // should fail the start, not a half-running daemon.
        let mut api_addr = None;
        let mut api_task = None;
        if let Some(listen) = config.listen {
            let ctx = ApiContext {
                state: state.clone(),
                exposer: config.exposer.clone(),
                cancel: system.cancel.child_token(),
            };
            let bound = api::bind(listen, ctx).await?;
            api_addr = Some(bound.local_addr);
            api_task = Some(tokio::spawn(async move {
                if let Err(e) = bound.serve().await {
                    error!(error = %e, "HTTP server failed");
                }
            }));
        }

        supervisor.start();
        info!(directory = %system.specs.path().display(), host = %system.host_id, "daemon started");

        Ok(Daemon { system, supervisor, state, api_addr, api_task })
    }

    /// Graceful shutdown: stop every instance, then cancel the remaining
    /// tasks and wait for the API to drain.
    pub async fn stop(self) {
        info!("shutting down");
        self.supervisor.stop().await;
        self.system.cancel.cancel();
        if let Some(api_task) = self.api_task {
            let _ = api_task.await;
        }
        info!("shutdown complete");
    }
}
