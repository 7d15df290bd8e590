// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Consul writer tests against the in-memory KV store.

use std::sync::Arc;
use std::time::Duration;

use moor_core::{ContainerInfo, Snapshot, Spec};
use tokio_util::sync::CancellationToken;

use super::memory::MemoryKv;
use super::*;
use crate::expose::{ExposedInstance, Exposer};

fn stable_record(host: &str, service: &str, image: &str) -> ExposedInstance {
    let container = ContainerInfo {
        id: format!("{service}-1"),
        spec: Spec::from_image(image),
        started_at: chrono::Utc::now(),
        stable_at: Some(chrono::Utc::now()),
        image: image.to_string(),
        network: None,
    };
    ExposedInstance::new(host, service, &Snapshot::Stable { container })
}

fn stopped_record(host: &str, service: &str) -> ExposedInstance {
    ExposedInstance::new(host, service, &Snapshot::Stopped)
}

async fn wait_for(mut check: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn publishes_snapshots_under_the_prefixed_key() {
    let kv = MemoryKv::new();
    let cancel = CancellationToken::new();
    let exposer = ConsulExposer::with_store(Arc::new(kv.clone()), "moor", cancel.clone());

    exposer.save_state(stable_record("host-a", "nginx", "img:good")).await;

    wait_for(|| kv.get("moor/host-a/nginx").is_some(), "the key to appear").await;
    let value: serde_json::Value =
        serde_json::from_slice(&kv.get("moor/host-a/nginx").unwrap()).unwrap();
    assert_eq!(value["State"], "Stable");
    cancel.cancel();
}

#[tokio::test]
async fn stopped_snapshots_delete_the_key() {
    let kv = MemoryKv::new();
    let cancel = CancellationToken::new();
    let exposer = ConsulExposer::with_store(Arc::new(kv.clone()), "moor", cancel.clone());

    exposer.save_state(stable_record("host-a", "nginx", "img:good")).await;
    wait_for(|| kv.get("moor/host-a/nginx").is_some(), "the key to appear").await;

    exposer.save_state(stopped_record("host-a", "nginx")).await;
    wait_for(|| kv.get("moor/host-a/nginx").is_none(), "the key to vanish").await;
    cancel.cancel();
}

#[tokio::test]
async fn failed_writes_stay_dirty_and_get_retried() {
    let kv = MemoryKv::new();
    kv.set_fail_writes(true);
    let cancel = CancellationToken::new();
    let exposer = ConsulExposer::with_store(Arc::new(kv.clone()), "moor", cancel.clone());

    exposer.save_state(stable_record("host-a", "nginx", "img:good")).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(kv.get("moor/host-a/nginx").is_none());

    kv.set_fail_writes(false);
    wait_for(|| kv.get("moor/host-a/nginx").is_some(), "the retried write").await;
    cancel.cancel();
}

#[tokio::test]
async fn a_new_session_republishes_every_entry() {
    let kv = MemoryKv::new();
    let cancel = CancellationToken::new();
    let exposer = ConsulExposer::with_store(Arc::new(kv.clone()), "moor", cancel.clone());

    exposer.save_state(stable_record("host-a", "nginx", "img:good")).await;
    wait_for(|| kv.session_of("moor/host-a/nginx").is_some(), "the first write").await;
    let first_session = kv.session_of("moor/host-a/nginx").unwrap();

    // The agent dropping the session forces a reacquire; the writer must
    // re-publish everything under the fresh lease.
    kv.invalidate_sessions();
    wait_for(
        || kv.session_of("moor/host-a/nginx").is_some_and(|s| s != first_session),
        "the republished entry",
    )
    .await;
    cancel.cancel();
}

#[tokio::test]
async fn receive_states_decodes_hosts_and_services_from_keys() {
    let kv = MemoryKv::new();
    let session = kv.create_session(Duration::from_secs(10)).await.unwrap();
    let record = stable_record("host-b", "web", "img:good");
    kv.acquire(
        "moor/host-b/web",
        serde_json::to_vec(&record.snapshot).unwrap(),
        &session,
    )
    .await
    .unwrap();

    let cancel = CancellationToken::new();
    let exposer = ConsulExposer::with_store(Arc::new(kv.clone()), "moor", cancel.clone());
    let mut states = exposer.receive_states(cancel.clone());

    let records = tokio::time::timeout(Duration::from_secs(5), states.recv())
        .await
        .expect("timed out")
        .expect("stream closed");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].host, "host-b");
    assert_eq!(records[0].service, "web");
    assert_eq!(records[0].snapshot["State"], "Stable");
    cancel.cancel();
}
