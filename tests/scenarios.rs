// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios over a full daemon with the fake runtime.
//!
//! These drive the whole stack (spec directory, supervisor, instances,
//! state manager, HTTP API) the way an operator would: write spec files,
//! watch states converge, delete specs, shut down.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use moor_core::Snapshot;
use moor_daemon::{Daemon, DaemonConfig, InstanceBirth};
use moor_runtime::FakeRuntime;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

async fn start_daemon(dir: &Path, runtime: &FakeRuntime, listen: bool) -> Daemon {
    Daemon::start(
        Arc::new(runtime.clone()),
        DaemonConfig {
            directory: dir.to_path_buf(),
            listen: listen.then(|| "127.0.0.1:0".parse().unwrap()),
            host_id: "host-test".to_string(),
            exposer: None,
        },
    )
    .await
    .expect("daemon should start")
}

fn write_spec(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(format!("{name}.toml")), content).unwrap();
}

async fn next_birth(births: &mut mpsc::Receiver<InstanceBirth>) -> InstanceBirth {
    tokio::time::timeout(Duration::from_secs(10), births.recv())
        .await
        .expect("timed out waiting for an instance")
        .expect("births stream closed")
}

async fn expect_state(snapshots: &mut broadcast::Receiver<Snapshot>, expected: &str) -> Snapshot {
    let snapshot = tokio::time::timeout(Duration::from_secs(20), snapshots.recv())
        .await
        .expect("timed out waiting for a snapshot")
        .expect("snapshot stream closed");
    assert_eq!(snapshot.state_name(), expected, "got {snapshot:?}");
    snapshot
}

#[tokio::test]
async fn healthy_workload_reaches_stable_and_stops_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let daemon = start_daemon(dir.path(), &runtime, false).await;
    let mut births = daemon.supervisor.subscribe();

    write_spec(dir.path(), "spec1", r#"image = "img:good""#);
    let birth = next_birth(&mut births).await;
    let mut snapshots = birth.snapshots;
    expect_state(&mut snapshots, "Wait").await;
    expect_state(&mut snapshots, "Stable").await;

    daemon.stop().await;
    expect_state(&mut snapshots, "Stopped").await;
    assert!(runtime.running_ids().is_empty());
}

#[tokio::test]
async fn after_rollover_hands_over_through_both_started() {
    let dir = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let daemon = start_daemon(dir.path(), &runtime, false).await;
    let mut births = daemon.supervisor.subscribe();

    write_spec(dir.path(), "web", "image = \"img:good\"\ndeploy = { after = 1 }\n");
    let birth = next_birth(&mut births).await;
    let mut snapshots = birth.snapshots;
    expect_state(&mut snapshots, "Wait").await;
    expect_state(&mut snapshots, "Stable").await;

    write_spec(dir.path(), "web", "image = \"img:good2\"\ndeploy = { after = 1 }\n");
    expect_state(&mut snapshots, "WaitNext").await;
    expect_state(&mut snapshots, "BothStarted").await;
    let stable = expect_state(&mut snapshots, "Stable").await;
    let Snapshot::Stable { container } = stable else { unreachable!() };
    assert_eq!(container.image, "img:good2");

    daemon.stop().await;
    expect_state(&mut snapshots, "Stopped").await;
    assert!(runtime.running_ids().is_empty());
}

#[tokio::test]
async fn deleting_a_spec_stops_only_that_workload() {
    let dir = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let daemon = start_daemon(dir.path(), &runtime, false).await;
    let mut births = daemon.supervisor.subscribe();

    write_spec(dir.path(), "a", r#"image = "img:good""#);
    let a = next_birth(&mut births).await;
    let mut a_snapshots = a.snapshots;
    expect_state(&mut a_snapshots, "Wait").await;
    expect_state(&mut a_snapshots, "Stable").await;

    write_spec(dir.path(), "b", r#"image = "img:good2""#);
    let b = next_birth(&mut births).await;
    let mut b_snapshots = b.snapshots;
    expect_state(&mut b_snapshots, "Wait").await;
    expect_state(&mut b_snapshots, "Stable").await;

    std::fs::remove_file(dir.path().join("a.toml")).unwrap();
    expect_state(&mut a_snapshots, "Stopped").await;
    assert_eq!(runtime.running_ids().len(), 1);

    daemon.stop().await;
    expect_state(&mut b_snapshots, "Stopped").await;
    assert!(runtime.running_ids().is_empty());
}

#[tokio::test]
async fn state_endpoint_serves_the_local_map() {
    let dir = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let daemon = start_daemon(dir.path(), &runtime, true).await;
    let base = format!("http://{}", daemon.api_addr.unwrap());
    let client = reqwest::Client::new();

    let greeting = client.get(&base).send().await.unwrap().text().await.unwrap();
    assert_eq!(greeting, "Welcome to moor");

    write_spec(dir.path(), "web", r#"image = "img:good""#);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    let state = loop {
        let state: serde_json::Value = client
            .get(format!("{base}/v1/state"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if state["web"]["State"] == "Stable" {
            break state;
        }
        assert!(tokio::time::Instant::now() < deadline, "last state: {state}");
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    assert_eq!(state["web"]["Container"]["Image"], "img:good");

    // No exposer configured: the cluster view is not implemented.
    let global = client.get(format!("{base}/v1/global-state")).send().await.unwrap();
    assert_eq!(global.status(), reqwest::StatusCode::NOT_IMPLEMENTED);

    daemon.stop().await;
}

#[tokio::test]
async fn state_stream_pushes_full_map_frames() {
    let dir = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let daemon = start_daemon(dir.path(), &runtime, true).await;
    let url = format!("ws://{}/v1/state-stream", daemon.api_addr.unwrap());

    let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (_, mut frames) = socket.split();

    write_spec(dir.path(), "web", r#"image = "img:good""#);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let message = tokio::time::timeout_at(deadline, frames.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("stream errored");
        if let tokio_tungstenite::tungstenite::Message::Text(text) = message {
            let frame: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["web"]["State"] == "Stable" {
                break;
            }
        }
    }

    daemon.stop().await;
}

#[tokio::test]
async fn wait_for_blocks_until_the_image_is_deployed() {
    let dir = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let daemon = start_daemon(dir.path(), &runtime, true).await;
    let base = format!("http://{}", daemon.api_addr.unwrap());
    let client = reqwest::Client::new();

    // Bad parameters are rejected synchronously.
    let bad = client
        .get(format!("{base}/v1/wait-for?scope=planetary&service=web&image=x"))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);

    // Global scope without an exposer is not implemented.
    let global = client
        .get(format!("{base}/v1/wait-for?scope=global&service=web&image=x"))
        .send()
        .await
        .unwrap();
    assert_eq!(global.status(), reqwest::StatusCode::NOT_IMPLEMENTED);

    // An image that never deploys times out with 504.
    write_spec(dir.path(), "web", r#"image = "img:good""#);
    let timed_out = client
        .get(format!("{base}/v1/wait-for?service=web&image=img:nope&timeout=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(timed_out.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);

    // Start the wait first, then roll the workload to the awaited image.
    let waiter = tokio::spawn({
        let client = client.clone();
        let url =
            format!("{base}/v1/wait-for?service=web&image=img:good2&timeout=30");
        async move { client.get(url).send().await.unwrap().status() }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    write_spec(dir.path(), "web", r#"image = "img:good2""#);

    let status = tokio::time::timeout(Duration::from_secs(25), waiter)
        .await
        .expect("wait-for did not return")
        .unwrap();
    assert_eq!(status, reqwest::StatusCode::OK);

    daemon.stop().await;
}
