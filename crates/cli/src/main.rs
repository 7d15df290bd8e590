// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! moor: reliable and simple idempotent supervisor for Docker containers.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod commands;
mod exit_error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use moor_runtime::RegistryAuth;
use tracing_subscriber::EnvFilter;

use exit_error::ExitError;

#[derive(Parser)]
#[command(
    name = "moor",
    version,
    about = "Reliable and simple idempotent supervisor for Docker containers"
)]
struct Cli {
    /// Docker registry credentials as host:login:password (repeatable)
    #[arg(long = "docker-auth", value_name = "HOST:USER:PASS", global = true)]
    docker_auth: Vec<String>,

    /// Enable debug logs
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start one container from a spec file and exit
    Execute {
        /// Path to the workload spec
        path: PathBuf,
    },
    /// Run the supervisor daemon
    Start(commands::start::StartArgs),
    /// Live cluster dashboard over a state-stream
    Top(commands::top::TopArgs),
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_auths(raw: &[String]) -> Result<Vec<RegistryAuth>, ExitError> {
    raw.iter()
        .map(|value| RegistryAuth::parse(value).map_err(|e| ExitError::new(2, e.to_string())))
        .collect()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = run(cli).await;
    if let Err(e) = result {
        eprintln!("moor: {}", e);
        std::process::exit(e.code);
    }
}

async fn run(cli: Cli) -> Result<(), ExitError> {
    let auths = parse_auths(&cli.docker_auth)?;
    match cli.command {
        Command::Execute { path } => commands::execute::run(&path, auths).await,
        Command::Start(args) => commands::start::run(args, auths).await,
        Command::Top(args) => commands::top::run(args).await,
    }
}
