// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The instance state machine.
//!
//! Transitions take the state by value: containers move between fields, and
//! any reference a transition drops is stopped inside that same transition.
//! Timer events carry tokens matched against the scheduling state; a stale
//! token or a health verdict for an unowned container is discarded.
//!
//! `apply` returns the next state plus a publish flag: a transition that
//! built a fresh state emits a snapshot even when it is structurally equal
//! to the previous one (a failed retry publishes `TryAgain` again), while a
//! discarded event keeps the incumbent state silent.

use moor_core::{Event, Snapshot, Spec};
use tracing::{debug, warn};
use uuid::Uuid;

use super::container::Container;
use super::InstanceCtx;

pub(crate) enum State {
    Init,
    Wait { container: Container },
    TryAgain { retry_id: Uuid, spec: Spec },
    Stable { container: Container },
    WaitNext { current: Container, next: Container },
    TryAgainNext { current: Container, retry_id: Uuid, spec: Spec },
    BothStarted { prev: Container, next: Container, deploy_id: Uuid },
    Stopped,
}

impl State {
    /// Serializable projection published to subscribers.
    pub(crate) fn snapshot(&self) -> Snapshot {
        match self {
            State::Init => Snapshot::Init,
            State::Wait { container } => Snapshot::Wait { container: container.info.clone() },
            State::TryAgain { spec, .. } => Snapshot::TryAgain { spec: spec.clone() },
            State::Stable { container } => Snapshot::Stable { container: container.info.clone() },
            State::WaitNext { current, next } => Snapshot::WaitNext {
                current: current.info.clone(),
                next: next.info.clone(),
            },
            State::TryAgainNext { current, spec, .. } => Snapshot::TryAgainNext {
                current: current.info.clone(),
                spec: spec.clone(),
            },
            State::BothStarted { prev, next, .. } => Snapshot::BothStarted {
                prev: prev.info.clone(),
                next: next.info.clone(),
            },
            State::Stopped => Snapshot::Stopped,
        }
    }

    pub(crate) async fn apply(self, ctx: &InstanceCtx, event: Event) -> (State, bool) {
        match self {
            State::Init => match event {
                Event::NewSpec(spec) => (ctx.start_or_try_again(spec).await, true),
                Event::Stop => (State::Stopped, true),
                other => unexpected(ctx, State::Init, other),
            },

            State::Wait { container } => match event {
                Event::NewSpec(spec) => {
                    container.stop(ctx).await;
                    (ctx.start_or_try_again(spec).await, true)
                }
                Event::Healthy { container_id } if container_id == container.info.id => {
                    (State::Stable { container: container.stabilized() }, true)
                }
                Event::Unhealthy { container_id } if container_id == container.info.id => {
                    // The container stays up: a healthy verdict may still
                    // arrive, so keep polling rather than restart.
                    warn!(instance = %ctx.name, container = %container_id,
                          "container not healthy yet, keep waiting");
                    container.spawn_health_poller(ctx);
                    (State::Wait { container }, false)
                }
                Event::Healthy { container_id } | Event::Unhealthy { container_id } => {
                    stale_verdict(ctx, &container_id);
                    (State::Wait { container }, false)
                }
                Event::Stop => {
                    container.stop(ctx).await;
                    (State::Stopped, true)
                }
                other => unexpected(ctx, State::Wait { container }, other),
            },

            State::TryAgain { retry_id, spec } => match event {
                Event::NewSpec(new_spec) => (ctx.start_or_try_again(new_spec).await, true),
                Event::Try { id } if id == retry_id => {
                    (ctx.start_or_try_again(spec).await, true)
                }
                Event::Try { id } => {
                    stale_token(ctx, id);
                    (State::TryAgain { retry_id, spec }, false)
                }
                Event::Stop => (State::Stopped, true),
                other => unexpected(ctx, State::TryAgain { retry_id, spec }, other),
            },

            State::Stable { container } => match event {
                Event::NewSpec(spec) => {
                    // The running container's spec decides how it is to be
                    // replaced; the grace contract belongs to the process
                    // being wound down.
                    if container.info.spec.deploy.is_before() {
                        container.stop(ctx).await;
                        (ctx.start_or_try_again(spec).await, true)
                    } else {
                        (ctx.start_or_try_again_next(container, spec).await, true)
                    }
                }
                Event::Healthy { container_id } | Event::Unhealthy { container_id } => {
                    stale_verdict(ctx, &container_id);
                    (State::Stable { container }, false)
                }
                Event::Stop => {
                    container.stop(ctx).await;
                    (State::Stopped, true)
                }
                other => unexpected(ctx, State::Stable { container }, other),
            },

            State::WaitNext { current, next } => match event {
                Event::NewSpec(spec) => {
                    if spec.deploy.is_before() {
                        current.stop(ctx).await;
                        next.stop(ctx).await;
                        (ctx.start_or_try_again(spec).await, true)
                    } else {
                        next.stop(ctx).await;
                        (ctx.start_or_try_again_next(current, spec).await, true)
                    }
                }
                Event::Healthy { container_id } if container_id == next.info.id => {
                    let next = next.stabilized();
                    let grace = current.info.spec.deploy.grace_seconds().unwrap_or(0);
                    let deploy_id =
                        ctx.schedule_deploy_completed(std::time::Duration::from_secs(grace));
                    (State::BothStarted { prev: current, next, deploy_id }, true)
                }
                Event::Unhealthy { container_id } if container_id == next.info.id => {
                    warn!(instance = %ctx.name, container = %container_id,
                          "replacement container failed its health check, will try again later");
                    let spec = next.info.spec.clone();
                    next.stop(ctx).await;
                    (State::TryAgainNext { current, retry_id: ctx.schedule_try(), spec }, true)
                }
                Event::Healthy { container_id } | Event::Unhealthy { container_id } => {
                    stale_verdict(ctx, &container_id);
                    (State::WaitNext { current, next }, false)
                }
                Event::Stop => {
                    current.stop(ctx).await;
                    next.stop(ctx).await;
                    (State::Stopped, true)
                }
                other => unexpected(ctx, State::WaitNext { current, next }, other),
            },

            State::TryAgainNext { current, retry_id, spec } => match event {
                Event::NewSpec(new_spec) => {
                    (ctx.start_or_try_again_next(current, new_spec).await, true)
                }
                Event::Try { id } if id == retry_id => {
                    (ctx.start_or_try_again_next(current, spec).await, true)
                }
                Event::Try { id } => {
                    stale_token(ctx, id);
                    (State::TryAgainNext { current, retry_id, spec }, false)
                }
                Event::Stop => {
                    current.stop(ctx).await;
                    (State::Stopped, true)
                }
                other => unexpected(ctx, State::TryAgainNext { current, retry_id, spec }, other),
            },

            State::BothStarted { prev, next, deploy_id } => match event {
                Event::NewSpec(spec) => {
                    prev.stop(ctx).await;
                    (ctx.start_or_try_again_next(next, spec).await, true)
                }
                Event::DeployCompleted { id } if id == deploy_id => {
                    prev.stop(ctx).await;
                    (State::Stable { container: next }, true)
                }
                Event::DeployCompleted { id } => {
                    stale_token(ctx, id);
                    (State::BothStarted { prev, next, deploy_id }, false)
                }
                Event::Stop => {
                    prev.stop(ctx).await;
                    next.stop(ctx).await;
                    (State::Stopped, true)
                }
                other => unexpected(ctx, State::BothStarted { prev, next, deploy_id }, other),
            },

            State::Stopped => {
                debug!(instance = %ctx.name, event = event.name(), "event after stop ignored");
                (State::Stopped, false)
            }
        }
    }
}

fn unexpected(ctx: &InstanceCtx, state: State, event: Event) -> (State, bool) {
    warn!(instance = %ctx.name, state = %state.snapshot(), event = event.name(), "unexpected event");
    (state, false)
}

fn stale_verdict(ctx: &InstanceCtx, container_id: &str) {
    debug!(instance = %ctx.name, container = %container_id,
           "health verdict for a container no longer owned, discarded");
}

fn stale_token(ctx: &InstanceCtx, id: Uuid) {
    debug!(instance = %ctx.name, token = %id, "stale timer token, discarded");
}
