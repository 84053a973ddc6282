//! The scale manager: the single serialization point for scale decisions.
//!
//! Every scale operation in the system, whether triggered by bounds
//! enforcement or by a policy alert, arrives here as a [`ScaleRequest`].
//! The manager is single-threaded by construction, so no two engine calls
//! ever run concurrently, and it is the only code that writes group status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use capstan_api::{events, AdjustmentType, AutoscalingGroup, Node, ScaleDirection};
use capstan_cluster::{EventRecorder, EventType, Registry, Store};
use capstan_engines::Engine;

use crate::error::ScaleError;

/// Component name used in recorded events.
pub const SCALE_MANAGER_NAME: &str = "ScaleManager";

/// A request to the scale manager to perform one scaling operation.
#[derive(Debug)]
pub struct ScaleRequest {
    /// Name of the AutoscalingGroup to scale.
    pub group: String,
    /// Direction of the adjustment.
    pub direction: ScaleDirection,
    /// How to interpret the adjustment value.
    pub adjustment_type: AdjustmentType,
    /// Node count or percentage, per the adjustment type.
    pub adjustment_value: f64,
    /// Set only by bounds enforcement: an out-of-bounds condition cannot be
    /// gated by cooldown.
    pub ignore_cooldown: bool,
    /// Receives exactly one reply for every accepted request. A caller that
    /// abandons the request must still drop its receiver, never block it.
    pub reply: oneshot::Sender<Result<(), ScaleError>>,
}

/// Serializes all scale decisions and actuates them through the engines.
pub struct ScaleManager {
    groups: Arc<Store<AutoscalingGroup>>,
    nodes: Arc<Store<Node>>,
    engines: Arc<Registry<dyn Engine>>,
    recorder: EventRecorder,
    requests: mpsc::Receiver<ScaleRequest>,
}

impl ScaleManager {
    /// Creates the manager and the sender side of its request channel.
    ///
    /// The channel holds a single request: producers await send until the
    /// manager is ready, which naturally throttles request issuance.
    #[must_use]
    pub fn new(
        groups: Arc<Store<AutoscalingGroup>>,
        nodes: Arc<Store<Node>>,
        engines: Arc<Registry<dyn Engine>>,
        recorder: EventRecorder,
    ) -> (Self, mpsc::Sender<ScaleRequest>) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                groups,
                nodes,
                engines,
                recorder,
                requests: rx,
            },
            tx,
        )
    }

    /// Runs the manager until the shutdown token fires or every producer is
    /// gone. Every accepted request gets exactly one reply.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down scale manager");
                    return;
                }
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        info!("scale request channel closed, shutting down scale manager");
                        return;
                    };

                    debug!(
                        group = %request.group,
                        direction = %request.direction,
                        adjustment_type = %request.adjustment_type,
                        adjustment_value = request.adjustment_value,
                        ignore_cooldown = request.ignore_cooldown,
                        "got scale request"
                    );

                    let ScaleRequest {
                        group,
                        direction,
                        adjustment_type,
                        adjustment_value,
                        ignore_cooldown,
                        reply,
                    } = request;

                    let result = self
                        .handle(&group, direction, adjustment_type, adjustment_value, ignore_cooldown)
                        .await;
                    // An abandoned caller has dropped its receiver; nothing
                    // to do about the reply then.
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn handle(
        &self,
        group_name: &str,
        direction: ScaleDirection,
        adjustment_type: AdjustmentType,
        adjustment_value: f64,
        ignore_cooldown: bool,
    ) -> Result<(), ScaleError> {
        let Some(group) = self.groups.get(group_name) else {
            info!(
                group = %group_name,
                "autoscaling group was deleted, ignoring scale request"
            );
            return Ok(());
        };

        if group.spec.suspended {
            // Happens when an outstanding request races an actor suspending
            // the group.
            self.recorder.event(
                group_name,
                EventType::Normal,
                events::SCALE_IGNORED,
                "autoscaling group is suspended",
            );
            return Ok(());
        }

        if !ignore_cooldown && is_cooling_down(&group, Utc::now()) {
            self.recorder.event(
                group_name,
                EventType::Normal,
                events::SCALE_IGNORED,
                "autoscaling group is cooling down",
            );
            return Ok(());
        }

        let engine = self.engines.get(&group.spec.engine)?;

        let current = self.nodes.list_selected(&group.spec.node_selector).len() as u32;
        let target = calculate_target(
            current,
            group.spec.min_nodes,
            group.spec.max_nodes,
            direction,
            adjustment_type,
            adjustment_value,
        );

        if target == current {
            // The operation is a noop; worth a warning event when a bound
            // is what stopped it.
            if direction == ScaleDirection::Up && target == group.spec.max_nodes {
                self.recorder.event(
                    group_name,
                    EventType::Warning,
                    events::SCALE_IGNORED,
                    format!(
                        "scale up operation would exceed the upper bound of {} nodes",
                        group.spec.max_nodes
                    ),
                );
            } else if direction == ScaleDirection::Down && target == group.spec.min_nodes {
                self.recorder.event(
                    group_name,
                    EventType::Warning,
                    events::SCALE_IGNORED,
                    format!(
                        "scale down operation would exceed the lower bound of {} nodes",
                        group.spec.min_nodes
                    ),
                );
            }
            return Ok(());
        }

        let strategy = group.strategy_for(direction);
        let scaled = match engine
            .set_target_node_count(&group.spec.node_selector, target, &strategy)
            .await
        {
            Ok(scaled) => scaled,
            Err(err) => {
                self.recorder.event(
                    group_name,
                    EventType::Warning,
                    events::SCALE_ERROR,
                    format!("failed to scale: {err}"),
                );
                return Err(err.into());
            }
        };

        if !scaled {
            // A valid no-op at the engine must not start a cooldown.
            return Ok(());
        }

        let (reason, message) = match direction {
            ScaleDirection::Up => (
                events::SCALED_UP,
                format!("scaled up to {target} nodes using strategy {strategy:?}"),
            ),
            ScaleDirection::Down => (
                events::SCALED_DOWN,
                format!("scaled down to {target} nodes using strategy {strategy:?}"),
            ),
        };
        self.recorder
            .event(group_name, EventType::Normal, reason, message);

        // A failed status write is surfaced to the caller but does not roll
        // back the engine call that already happened.
        self.groups
            .update_status(group_name, group.metadata.resource_version, |g| {
                g.status.last_updated_at = Some(Utc::now());
            })?;
        Ok(())
    }
}

/// Computes the node count a request drives the group toward, clamped into
/// the group's bounds.
///
/// Absolute adjustments are truncated to an integer; percent adjustments
/// always take the ceiling of `current * 0.01 * value` so a nonzero
/// percentage on a small group still moves the count by at least one.
#[must_use]
pub fn calculate_target(
    current: u32,
    min: u32,
    max: u32,
    direction: ScaleDirection,
    adjustment_type: AdjustmentType,
    adjustment_value: f64,
) -> u32 {
    let current = i64::from(current);

    let step = match adjustment_type {
        AdjustmentType::Absolute => adjustment_value as i64,
        AdjustmentType::Percent => (current as f64 * 0.01 * adjustment_value).ceil() as i64,
    };

    let raw = match direction {
        ScaleDirection::Up => current.saturating_add(step),
        ScaleDirection::Down => current.saturating_sub(step),
    };

    raw.clamp(i64::from(min), i64::from(max)) as u32
}

/// Whether the group is inside its cooldown window at `now`. A group whose
/// status was never written is not cooling down; otherwise the window is
/// inclusive at both ends.
#[must_use]
pub fn is_cooling_down(group: &AutoscalingGroup, now: DateTime<Utc>) -> bool {
    match group.status.last_updated_at {
        None => false,
        Some(last) => (now - last).num_seconds() <= i64::from(group.spec.cooldown_period),
    }
}
