// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Directory-backed spec provider.
//!
//! `watch_specs` turns the directory listing into membership events at
//! roughly 1 Hz; `receive_specs` turns one file into a stream of parsed
//! specs, re-parsing only when the byte content changes. Both streams
//! terminate on cancellation and survive transient I/O errors by logging
//! and polling again.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use moor_core::{Spec, RESERVED_NAME, SPEC_EXTENSION};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const DIRECTORY_POLL: Duration = Duration::from_secs(1);
const FILE_POLL: Duration = Duration::from_secs(2);

/// Membership change in the spec directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Appeared(String),
    Disappeared(String),
}

impl WatchEvent {
    pub fn name(&self) -> &str {
        match self {
            WatchEvent::Appeared(name) | WatchEvent::Disappeared(name) => name,
        }
    }
}

/// Spec provider polling a local directory of `.toml` workload specs.
#[derive(Debug, Clone)]
pub struct DirectorySpecs {
    path: PathBuf,
}

impl DirectorySpecs {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn spec_path(&self, name: &str) -> PathBuf {
        self.path.join(format!("{}.{}", name, SPEC_EXTENSION))
    }

    async fn read_dir_tick(&self) -> std::io::Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SPEC_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem == RESERVED_NAME {
                continue;
            }
            names.insert(stem.to_string());
        }
        Ok(names)
    }

    /// Stream of appeared/disappeared workload names.
    pub fn watch_specs(&self, cancel: CancellationToken) -> mpsc::Receiver<WatchEvent> {
        let (tx, rx) = mpsc::channel(16);
        let provider = self.clone();
        tokio::spawn(async move {
            let mut previous = BTreeSet::new();
            loop {
                match provider.read_dir_tick().await {
                    Err(e) => {
                        warn!(directory = %provider.path.display(), error = %e, "can't read specs dir");
                    }
                    Ok(names) => {
                        for appeared in names.difference(&previous) {
                            let event = WatchEvent::Appeared(appeared.clone());
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                res = tx.send(event) => if res.is_err() { return },
                            }
                        }
                        for disappeared in previous.difference(&names) {
                            let event = WatchEvent::Disappeared(disappeared.clone());
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                res = tx.send(event) => if res.is_err() { return },
                            }
                        }
                        previous = names;
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(DIRECTORY_POLL) => {}
                }
            }
        });
        rx
    }

    /// Stream of parsed specs for one workload, emitted on byte change.
    pub fn receive_specs(&self, name: &str, cancel: CancellationToken) -> mpsc::Receiver<Spec> {
        let (tx, rx) = mpsc::channel(4);
        let path = self.spec_path(name);
        let name = name.to_string();
        tokio::spawn(async move {
            let mut previous: Option<Vec<u8>> = None;
            loop {
                let parsed = read_tick(&name, &path, &mut previous).await;
                match parsed {
                    Some(spec) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            res = tx.send(spec) => if res.is_err() { return },
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(FILE_POLL) => {}
                        }
                    }
                }
            }
        });
        rx
    }
}

/// One poll of the spec file. Returns a spec only when the bytes changed
/// and parsed; `previous` is updated on successful parse so a broken edit
/// keeps the prior spec in force and is retried every tick.
async fn read_tick(name: &str, path: &Path, previous: &mut Option<Vec<u8>>) -> Option<Spec> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) => {
            warn!(spec = name, error = %e, "can't read spec file");
            return None;
        }
    };

    if previous.as_deref() == Some(content.as_slice()) {
        return None;
    }

    match Spec::parse(&content) {
        Ok(spec) => {
            *previous = Some(content);
            Some(spec)
        }
        Err(e) => {
            warn!(spec = name, error = %e, "can't parse spec file");
            None
        }
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
