// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `moor execute`: start one container from a spec file and exit.

use std::path::Path;
use std::sync::Arc;

use moor_core::Spec;
use moor_runtime::{ContainerRuntime, DockerRuntime, RegistryAuth};

use crate::exit_error::ExitError;

pub async fn run(path: &Path, auths: Vec<RegistryAuth>) -> Result<(), ExitError> {
    let content = tokio::fs::read(path)
        .await
        .map_err(|e| ExitError::new(1, format!("can't read {}: {}", path.display(), e)))?;
    let spec = Spec::parse(&content)
        .map_err(|e| ExitError::new(1, format!("can't parse {}: {}", path.display(), e)))?;

    let workload = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| ExitError::new(2, format!("{} has no usable file name", path.display())))?;

    let runtime = Arc::new(
        DockerRuntime::new(auths).map_err(|e| ExitError::new(1, e.to_string()))?,
    );
    let started = runtime
        .start(workload, &spec)
        .await
        .map_err(|e| ExitError::new(1, format!("can't start container: {}", e)))?;

    println!("{}", started.id);
    Ok(())
}
