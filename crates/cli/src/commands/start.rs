// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `moor start`: run the supervisor daemon until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use moor_daemon::expose::consul::ConsulExposer;
use moor_daemon::expose::gossip::{GossipConfig, GossipExposer};
use moor_daemon::expose::Exposer;
use moor_daemon::{Daemon, DaemonConfig};
use moor_runtime::{DockerRuntime, RegistryAuth};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::exit_error::ExitError;

#[derive(Args)]
pub struct StartArgs {
    /// Directory with workload specs
    #[arg(long, value_name = "PATH")]
    pub directory: PathBuf,

    /// HTTP API and dashboard address
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:4765")]
    pub listen: SocketAddr,

    /// This host's name in cluster views (defaults to the hostname)
    #[arg(long = "instance-name", value_name = "ID")]
    pub instance_name: Option<String>,

    /// Replicate state into this Consul KV prefix
    #[arg(long = "expose-consul", value_name = "PREFIX", conflicts_with = "expose_gossip")]
    pub expose_consul: Option<String>,

    /// Aggregate cluster state over gossip membership
    #[arg(long = "expose-gossip")]
    pub expose_gossip: bool,

    /// Seed addresses for the gossip ring (repeatable)
    #[arg(long = "gossip-connect", value_name = "ADDR", requires = "expose_gossip")]
    pub gossip_connect: Vec<String>,

    /// UDP bind address for gossip
    #[arg(long = "gossip-bind", value_name = "ADDR", default_value = "0.0.0.0:7946")]
    pub gossip_bind: SocketAddr,

    /// UDP address advertised to gossip peers (defaults to the bind address)
    #[arg(long = "gossip-advertise", value_name = "ADDR")]
    pub gossip_advertise: Option<SocketAddr>,

    /// API host advertised to gossip peers (defaults to this node's address)
    #[arg(long = "api-advertise", value_name = "HOST")]
    pub api_advertise: Option<String>,

    /// API port advertised to gossip peers (defaults to the listen port)
    #[arg(long = "api-port", value_name = "PORT")]
    pub api_port: Option<u16>,
}

pub async fn run(args: StartArgs, auths: Vec<RegistryAuth>) -> Result<(), ExitError> {
    let host_id = match args.instance_name.clone() {
        Some(name) => name,
        None => hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .map_err(|e| ExitError::new(1, format!("can't detect hostname: {}", e)))?,
    };

    let runtime = Arc::new(
        DockerRuntime::new(auths)
            .map_err(|e| ExitError::new(1, format!("docker client: {}", e)))?,
    );

    // The exposer outlives the daemon teardown by a token of its own.
    let expose_cancel = CancellationToken::new();
    let exposer = build_exposer(&args, &host_id, &expose_cancel).await?;

    let daemon = Daemon::start(
        runtime,
        DaemonConfig {
            directory: args.directory,
            listen: Some(args.listen),
            host_id,
            exposer,
        },
    )
    .await
    .map_err(|e| ExitError::new(1, e.to_string()))?;

    wait_for_shutdown_signal().await;

    daemon.stop().await;
    expose_cancel.cancel();
    Ok(())
}

async fn build_exposer(
    args: &StartArgs,
    host_id: &str,
    cancel: &CancellationToken,
) -> Result<Option<Arc<dyn Exposer>>, ExitError> {
    if let Some(prefix) = &args.expose_consul {
        let exposer = ConsulExposer::new(prefix.clone(), cancel.clone())
            .map_err(|e| ExitError::new(1, format!("consul exposer: {}", e)))?;
        return Ok(Some(Arc::new(exposer)));
    }

    if args.expose_gossip {
        let config = GossipConfig {
            host_id: host_id.to_string(),
            connects: args.gossip_connect.clone(),
            bind_addr: args.gossip_bind,
            advertise_addr: args.gossip_advertise.unwrap_or(args.gossip_bind),
            api_addr: args.api_advertise.clone().unwrap_or_default(),
            api_port: args.api_port.unwrap_or_else(|| args.listen.port()),
        };
        let exposer = GossipExposer::new(config)
            .await
            .map_err(|e| ExitError::new(1, format!("gossip exposer: {}", e)))?;
        return Ok(Some(Arc::new(exposer)));
    }

    Ok(None)
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!(error = %e, "can't install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
    }
}
