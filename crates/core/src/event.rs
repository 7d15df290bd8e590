// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event alphabet of the instance state machine.
//!
//! Timer-scheduled events carry an opaque token minted when the timer was
//! scheduled. A transition that replaces a pending timer changes the token
//! it expects, so a late delivery from the superseded timer is discarded on
//! arrival instead of resurrecting a cancelled schedule.

use uuid::Uuid;

use crate::spec::Spec;

/// Events consumed by one instance's event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A byte-different spec for the workload, from the spec stream or from
    /// the image watcher (which replays the current spec on digest change).
    NewSpec(Spec),
    /// A started container reported healthy.
    Healthy { container_id: String },
    /// The health deadline elapsed without a healthy report.
    Unhealthy { container_id: String },
    /// Retry timer fired after a failed start.
    Try { id: Uuid },
    /// Rollover grace window elapsed.
    DeployCompleted { id: Uuid },
    /// Stop every owned container and terminate.
    Stop,
}

impl Event {
    /// Short name for structured logging.
    pub fn name(&self) -> &'static str {
        match self {
            Event::NewSpec(_) => "NewSpec",
            Event::Healthy { .. } => "Healthy",
            Event::Unhealthy { .. } => "Unhealthy",
            Event::Try { .. } => "Try",
            Event::DeployCompleted { .. } => "DeployCompleted",
            Event::Stop => "Stop",
        }
    }
}
