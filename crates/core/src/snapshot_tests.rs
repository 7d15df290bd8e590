// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot wire-shape tests.

use chrono::{TimeZone, Utc};
use yare::parameterized;

use super::*;
use crate::spec::Spec;

fn container(id: &str, image: &str) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        spec: Spec::from_image(image),
        started_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        stable_at: None,
        image: image.to_string(),
        network: None,
    }
}

fn sample(state: &str) -> Snapshot {
    match state {
        "Init" => Snapshot::Init,
        "Wait" => Snapshot::Wait { container: container("c1", "app:v1") },
        "TryAgain" => Snapshot::TryAgain { spec: Spec::from_image("app:v1") },
        "Stable" => Snapshot::Stable { container: container("c1", "app:v1") },
        "WaitNext" => Snapshot::WaitNext {
            current: container("c1", "app:v1"),
            next: container("c2", "app:v2"),
        },
        "TryAgainNext" => Snapshot::TryAgainNext {
            current: container("c1", "app:v1"),
            spec: Spec::from_image("app:v2"),
        },
        "BothStarted" => Snapshot::BothStarted {
            prev: container("c1", "app:v1"),
            next: container("c2", "app:v2"),
        },
        "Stopped" => Snapshot::Stopped,
        other => panic!("unknown state {other}"),
    }
}

#[parameterized(
    init = { "Init" },
    wait = { "Wait" },
    try_again = { "TryAgain" },
    stable = { "Stable" },
    wait_next = { "WaitNext" },
    try_again_next = { "TryAgainNext" },
    both_started = { "BothStarted" },
    stopped = { "Stopped" },
)]
fn json_round_trip(state: &str) {
    let snapshot = sample(state);
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["State"], state);
    let back: Snapshot = serde_json::from_value(json).unwrap();
    assert_eq!(snapshot, back);
}

#[test]
fn container_fields_are_pascal_case() {
    let json = serde_json::to_value(sample("Stable")).unwrap();
    let container = &json["Container"];
    assert!(container["Id"].is_string());
    assert!(container["Image"].is_string());
    assert!(container["StartedAt"].is_string());
    assert!(container["Spec"].is_object());
    // Unset optionals stay off the wire.
    assert!(container.get("StableAt").is_none());
    assert!(container.get("Network").is_none());
}

#[test]
fn deployed_image_projection() {
    assert_eq!(sample("Init").deployed_image(), None);
    assert_eq!(sample("Wait").deployed_image(), None);
    assert_eq!(sample("TryAgain").deployed_image(), None);
    assert_eq!(sample("Stable").deployed_image(), Some("app:v1"));
    assert_eq!(sample("WaitNext").deployed_image(), Some("app:v1"));
    assert_eq!(sample("TryAgainNext").deployed_image(), Some("app:v1"));
    assert_eq!(sample("BothStarted").deployed_image(), Some("app:v2"));
    assert_eq!(sample("Stopped").deployed_image(), None);
}

#[test]
fn display_matches_state_name() {
    assert_eq!(sample("WaitNext").to_string(), "WaitNext");
    assert_eq!(Snapshot::Stopped.to_string(), "Stopped");
}
