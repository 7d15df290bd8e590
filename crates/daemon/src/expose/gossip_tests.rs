// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cluster-state merge tests.

use std::collections::HashMap;
use std::time::Duration;

use super::*;

fn services(entries: &[(&str, &str)]) -> HashMap<String, serde_json::Value> {
    entries
        .iter()
        .map(|(service, state)| {
            ((*service).to_string(), serde_json::json!({ "State": state }))
        })
        .collect()
}

#[test]
fn merge_replaces_a_peer_wholesale() {
    let state = ClusterState::default();
    state.merge("host-a", services(&[("web", "Wait"), ("db", "Stable")]));
    state.merge("host-b", services(&[("web", "Stable")]));
    assert_eq!(state.flatten().len(), 3);

    // A fresh frame replaces the peer's whole contribution.
    state.merge("host-a", services(&[("web", "Stable")]));
    let records = state.flatten();
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|r| !(r.host == "host-a" && r.service == "db")));
}

#[test]
fn removing_a_peer_drops_its_contribution() {
    let state = ClusterState::default();
    state.merge("host-a", services(&[("web", "Stable")]));
    state.merge("host-b", services(&[("web", "Stable")]));

    state.remove("host-a");
    let records = state.flatten();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].host, "host-b");

    // Removing an unknown peer is a no-op.
    state.remove("host-c");
    assert_eq!(state.flatten().len(), 1);
}

#[tokio::test]
async fn merges_wake_pending_subscribers() {
    let state = std::sync::Arc::new(ClusterState::default());

    let notified = state.changed.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();

    state.merge("host-a", services(&[("web", "Wait")]));

    tokio::time::timeout(Duration::from_secs(1), notified)
        .await
        .expect("merge should wake subscribers");
}
