//! Bounds enforcement for autoscaling groups.
//!
//! Watches groups and nodes and keeps each non-suspended group's observed
//! node count inside its `[min, max]` bounds, independently of any metric
//! signal. Out-of-bounds conditions are corrected through the scale manager
//! with cooldown explicitly bypassed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use capstan_api::{AdjustmentType, AutoscalingGroup, Node, ScaleDirection};
use capstan_cluster::{selector_matches, Store, WatchEvent, WorkQueue};

use crate::error::ControllerError;
use crate::reconcile::Reconciler;
use crate::scale::ScaleRequest;

/// Component name used in logs.
pub const GROUP_CONTROLLER_NAME: &str = "AutoscalingGroupController";

const MAX_REQUEUES: u32 = 5;

/// Reconciles each group's node count against its min/max bounds.
pub struct GroupController {
    groups: Arc<Store<AutoscalingGroup>>,
    nodes: Arc<Store<Node>>,
    queue: Arc<WorkQueue>,
    scale_requests: mpsc::Sender<ScaleRequest>,
}

/// The bound the observed count is pulled back to: min when below, max when
/// above, the count itself otherwise.
fn desired_node_count(current: u32, min: u32, max: u32) -> u32 {
    if current < min {
        min
    } else if current > max {
        max
    } else {
        current
    }
}

/// The groups whose selector matches the given node labels. A group with an
/// empty selector matches every node.
pub(crate) fn groups_matching_node_labels<'a>(
    labels: &BTreeMap<String, String>,
    groups: &'a [AutoscalingGroup],
) -> Vec<&'a AutoscalingGroup> {
    groups
        .iter()
        .filter(|group| selector_matches(&group.spec.node_selector, labels))
        .collect()
}

impl GroupController {
    /// Creates the controller.
    #[must_use]
    pub fn new(
        groups: Arc<Store<AutoscalingGroup>>,
        nodes: Arc<Store<Node>>,
        scale_requests: mpsc::Sender<ScaleRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            groups,
            nodes,
            queue: WorkQueue::new(),
            scale_requests,
        })
    }

    /// Runs the controller until the shutdown token fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut group_events = self.groups.subscribe();
        let mut node_events = self.nodes.subscribe();

        info!(controller = GROUP_CONTROLLER_NAME, "starting controller");

        // Reconcile everything already present once at startup.
        for group in self.groups.list() {
            self.queue.add(&group.metadata.name);
        }

        let watcher = {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            this.queue.shut_down();
                            return;
                        }
                        event = group_events.recv() => match event {
                            Ok(event) => this.on_group_event(event),
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(
                                    controller = GROUP_CONTROLLER_NAME,
                                    missed,
                                    "lagged behind group watch"
                                );
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                this.queue.shut_down();
                                return;
                            }
                        },
                        event = node_events.recv() => match event {
                            Ok(event) => this.on_node_event(event),
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(
                                    controller = GROUP_CONTROLLER_NAME,
                                    missed,
                                    "lagged behind node watch"
                                );
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                this.queue.shut_down();
                                return;
                            }
                        },
                    }
                }
            })
        };

        self.worker().await;
        let _ = watcher.await;
        info!(controller = GROUP_CONTROLLER_NAME, "shut down");
    }

    fn on_group_event(&self, event: WatchEvent<AutoscalingGroup>) {
        match event {
            WatchEvent::Added(group) => self.queue.add(&group.metadata.name),
            WatchEvent::Modified { old, new } => {
                // Status writes leave the generation alone; only spec
                // changes need a fresh reconcile.
                if new.metadata.generation != old.metadata.generation {
                    self.queue.add(&new.metadata.name);
                }
            }
            WatchEvent::Deleted(_) => {}
        }
    }

    fn on_node_event(&self, event: WatchEvent<Node>) {
        let node = match event {
            WatchEvent::Added(node) | WatchEvent::Deleted(node) => node,
            WatchEvent::Modified { .. } => return,
        };

        let groups = self.groups.list();
        for group in groups_matching_node_labels(&node.metadata.labels, &groups) {
            self.queue.add(&group.metadata.name);
        }
    }
}

#[async_trait]
impl Reconciler for GroupController {
    fn name(&self) -> &'static str {
        GROUP_CONTROLLER_NAME
    }

    fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    fn max_requeues(&self) -> u32 {
        MAX_REQUEUES
    }

    async fn sync(&self, key: &str) -> Result<(), ControllerError> {
        let Some(group) = self.groups.get(key) else {
            // Deleted while queued; nothing to enforce.
            return Ok(());
        };

        if group.spec.suspended {
            info!(group = %key, "group is suspended, skipping bounds enforcement");
            return Ok(());
        }

        let current = self.nodes.list_selected(&group.spec.node_selector).len() as u32;
        let desired = desired_node_count(current, group.spec.min_nodes, group.spec.max_nodes);
        if desired == current {
            return Ok(());
        }

        let (delta, direction) = if desired > current {
            (desired - current, ScaleDirection::Up)
        } else {
            (current - desired, ScaleDirection::Down)
        };

        info!(
            group = %key,
            current,
            desired,
            %direction,
            "node count is outside the configured bounds"
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ScaleRequest {
            group: key.to_string(),
            direction,
            adjustment_type: AdjustmentType::Absolute,
            adjustment_value: f64::from(delta),
            ignore_cooldown: true,
            reply: reply_tx,
        };

        if self.scale_requests.send(request).await.is_err() {
            return Err(ControllerError::ScaleManagerUnavailable {
                group: key.to_string(),
            });
        }

        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ControllerError::ScaleRequest {
                group: key.to_string(),
                source: err,
            }),
            Err(_) => Err(ControllerError::ScaleManagerUnavailable {
                group: key.to_string(),
            }),
        }
    }
}
