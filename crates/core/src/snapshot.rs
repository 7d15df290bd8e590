// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Observable state of one workload.
//!
//! A [`Snapshot`] is the value an instance publishes after every state
//! transition. On the wire it is a JSON object with a `State` discriminant
//! plus the variant's fields, so `{"State":"Stable","Container":{...}}`
//! reads the same locally and in aggregated cluster views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::Spec;

/// Serializable view of one running container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInfo {
    /// Runtime identifier.
    pub id: String,
    /// The spec that produced this container.
    pub spec: Spec,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    /// Set when the first healthy verdict arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_at: Option<DateTime<Utc>>,
    /// Image reference the container was created from.
    pub image: String,
    /// Networking details from the runtime inspect (ports, addresses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<serde_json::Value>,
}

/// Instance state over one workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "State")]
pub enum Snapshot {
    /// No spec seen yet.
    Init,
    /// Container started; awaiting its first health verdict.
    Wait {
        #[serde(rename = "Container")]
        container: ContainerInfo,
    },
    /// Last start attempt failed; a retry is scheduled.
    TryAgain {
        #[serde(rename = "Spec")]
        spec: Spec,
    },
    /// One healthy container, no rollover in progress.
    Stable {
        #[serde(rename = "Container")]
        container: ContainerInfo,
    },
    /// Rollover: replacement started, awaiting its health.
    WaitNext {
        #[serde(rename = "Current")]
        current: ContainerInfo,
        #[serde(rename = "Next")]
        next: ContainerInfo,
    },
    /// Rollover attempt failed; the current container is kept and a retry
    /// is scheduled.
    TryAgainNext {
        #[serde(rename = "Current")]
        current: ContainerInfo,
        #[serde(rename = "Spec")]
        spec: Spec,
    },
    /// After-strategy only: replacement healthy, grace window running,
    /// both containers alive.
    BothStarted {
        #[serde(rename = "Prev")]
        prev: ContainerInfo,
        #[serde(rename = "Next")]
        next: ContainerInfo,
    },
    /// Terminal: the spec disappeared or the system is shutting down.
    Stopped,
}

impl Snapshot {
    /// Discriminant as it appears on the wire.
    pub fn state_name(&self) -> &'static str {
        match self {
            Snapshot::Init => "Init",
            Snapshot::Wait { .. } => "Wait",
            Snapshot::TryAgain { .. } => "TryAgain",
            Snapshot::Stable { .. } => "Stable",
            Snapshot::WaitNext { .. } => "WaitNext",
            Snapshot::TryAgainNext { .. } => "TryAgainNext",
            Snapshot::BothStarted { .. } => "BothStarted",
            Snapshot::Stopped => "Stopped",
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Snapshot::Stopped)
    }

    /// Image considered deployed for wait-for matching.
    ///
    /// During a rollover the *current* container is the deployed one; once
    /// both are started the replacement has taken over.
    pub fn deployed_image(&self) -> Option<&str> {
        match self {
            Snapshot::Stable { container } => Some(&container.image),
            Snapshot::WaitNext { current, .. } => Some(&current.image),
            Snapshot::TryAgainNext { current, .. } => Some(&current.image),
            Snapshot::BothStarted { next, .. } => Some(&next.image),
            Snapshot::Init
            | Snapshot::Wait { .. }
            | Snapshot::TryAgain { .. }
            | Snapshot::Stopped => None,
        }
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.state_name())
    }
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
