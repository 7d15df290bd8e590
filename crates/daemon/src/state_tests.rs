// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State manager aggregation tests.

use std::sync::Arc;
use std::time::Duration;

use moor_runtime::FakeRuntime;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::system::System;

struct Harness {
    dir: TempDir,
    supervisor: Arc<Supervisor>,
    state: StateManager,
}

fn prepare() -> Harness {
    let dir = TempDir::new().unwrap();
    let system = System::new(Arc::new(FakeRuntime::new()), dir.path(), "test-host");
    let supervisor = Supervisor::new(system.clone());
    let state = StateManager::new(&supervisor, system.cancel.child_token());
    supervisor.start();
    Harness { dir, supervisor, state }
}

impl Harness {
    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.dir.path().join(format!("{name}.toml")), content).unwrap();
    }

    /// Poll `read_current` until `check` passes.
    async fn wait_current(&self, check: impl Fn(&StateFrame) -> bool) -> StateFrame {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let current = self.state.read_current().await;
            if check(&current) {
                return current;
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out, last: {current:?}");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[tokio::test]
async fn current_converges_to_the_last_snapshot_of_every_instance() {
    let h = prepare();
    h.write("a", "image = \"img:good\"");
    h.write("b", "image = \"img:good2\"");

    let current = h
        .wait_current(|current| {
            current.get("a").map(|s| s.state_name()) == Some("Stable")
                && current.get("b").map(|s| s.state_name()) == Some("Stable")
        })
        .await;
    assert_eq!(current.len(), 2);

    // A removed workload leaves the map once its stream closes.
    std::fs::remove_file(h.dir.path().join("a.toml")).unwrap();
    h.wait_current(|current| !current.contains_key("a")).await;

    h.supervisor.stop().await;
}

#[tokio::test]
async fn subscribers_get_the_current_map_then_one_frame_per_change() {
    let h = prepare();
    h.write("a", "image = \"img:good\"");
    h.wait_current(|current| current.get("a").map(|s| s.state_name()) == Some("Stable")).await;

    let (initial, mut frames) = h.state.subscribe().await.expect("state manager gone");
    assert_eq!(initial.get("a").map(|s| s.state_name()), Some("Stable"));

    h.write("b", "image = \"img:good2\"");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let frame = tokio::time::timeout_at(deadline, frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("frame stream closed");
        // Every frame is a full map: workload a stays visible throughout.
        assert!(frame.contains_key("a"));
        if frame.get("b").map(|s| s.state_name()) == Some("Stable") {
            break;
        }
    }

    h.supervisor.stop().await;
}

#[tokio::test]
async fn read_current_is_empty_before_any_specs() {
    let dir = TempDir::new().unwrap();
    let system = System::new(Arc::new(FakeRuntime::new()), dir.path(), "test-host");
    let supervisor = Supervisor::new(system.clone());
    let state = StateManager::new(&supervisor, CancellationToken::new());
    supervisor.start();

    assert!(state.read_current().await.is_empty());
    supervisor.stop().await;
}
