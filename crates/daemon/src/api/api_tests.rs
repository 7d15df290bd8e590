// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wait-for parameter and projection tests. The endpoints themselves are
//! exercised end-to-end in the workspace scenario tests.

use super::*;
use moor_core::{ContainerInfo, Snapshot, Spec};

fn query(
    scope: Option<&str>,
    service: Option<&str>,
    image: Option<&str>,
    timeout: Option<&str>,
) -> WaitForQuery {
    WaitForQuery {
        scope: scope.map(String::from),
        service: service.map(String::from),
        image: image.map(String::from),
        timeout: timeout.map(String::from),
    }
}

#[test]
fn scope_defaults_to_local_and_timeout_to_sixty_seconds() {
    let params = parse_wait_query(query(None, Some("web"), Some("app:v1"), None)).unwrap();
    assert_eq!(params.scope, WaitScope::Local);
    assert_eq!(params.timeout, Duration::from_secs(60));
    assert_eq!(params.service, "web");
    assert_eq!(params.image, "app:v1");
}

#[test]
fn global_scope_is_accepted() {
    let params =
        parse_wait_query(query(Some("global"), Some("web"), Some("app:v1"), Some("5"))).unwrap();
    assert_eq!(params.scope, WaitScope::Global);
    assert_eq!(params.timeout, Duration::from_secs(5));
}

#[test]
fn bad_inputs_are_rejected() {
    assert!(parse_wait_query(query(Some("planetary"), Some("web"), Some("app:v1"), None)).is_err());
    assert!(parse_wait_query(query(None, None, Some("app:v1"), None)).is_err());
    assert!(parse_wait_query(query(None, Some("web"), None, None)).is_err());
    assert!(parse_wait_query(query(None, Some("web"), Some("app:v1"), Some("soon"))).is_err());
    assert!(parse_wait_query(query(None, Some("web"), Some("app:v1"), Some("0"))).is_err());
}

#[test]
fn frame_matching_uses_the_deployed_image_projection() {
    let container = ContainerInfo {
        id: "c1".to_string(),
        spec: Spec::from_image("app:v1"),
        started_at: chrono::Utc::now(),
        stable_at: None,
        image: "app:v1".to_string(),
        network: None,
    };

    let mut frame = StateFrame::new();
    frame.insert("web".to_string(), Snapshot::Wait { container: container.clone() });
    // A container that is merely started is not deployed.
    assert!(!frame_matches(&frame, "web", "app:v1"));

    frame.insert("web".to_string(), Snapshot::Stable { container });
    assert!(frame_matches(&frame, "web", "app:v1"));
    assert!(!frame_matches(&frame, "web", "app:v2"));
    assert!(!frame_matches(&frame, "db", "app:v1"));
}
