//! The poll manager: owns one group's pollers and fans their alerts into
//! scale requests.
//!
//! One manager exists per non-suspended group with policies. It launches a
//! poller per attached policy, forwards every alert to the scale manager,
//! and waits for the reply before touching the next alert. Any poller
//! failure or scale-request failure tears the whole manager down; the
//! policy watcher rebuilds it with a fresh state through its workqueue.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use capstan_api::{events, AutoscalingPolicy, ScaleDirection};
use capstan_cluster::{EventRecorder, EventType, Registry};
use capstan_metrics::Backend;

use crate::error::ControllerError;
use crate::poller::{Alert, MetricPoller};
use crate::scale::ScaleRequest;

/// Owns the pollers of a single autoscaling group.
pub(crate) struct PollManager {
    group_name: String,
    // Duplicates in the group's policy list collapse here.
    policy_names: HashSet<String>,
    pollers: Vec<MetricPoller>,
    recorder: EventRecorder,
    scale_requests: mpsc::Sender<ScaleRequest>,
}

impl PollManager {
    pub(crate) fn new(
        group_name: impl Into<String>,
        recorder: EventRecorder,
        scale_requests: mpsc::Sender<ScaleRequest>,
    ) -> Self {
        Self {
            group_name: group_name.into(),
            policy_names: HashSet::new(),
            pollers: Vec::new(),
            recorder,
            scale_requests,
        }
    }

    /// Adds a poller for the given policy. A policy listed twice by the
    /// group is ignored the second time.
    pub(crate) fn add_poller(
        &mut self,
        policy: AutoscalingPolicy,
        node_selector: BTreeMap<String, String>,
        backends: Arc<Registry<dyn Backend>>,
    ) {
        let name = policy.metadata.name.clone();
        if !self.policy_names.insert(name.clone()) {
            debug!(
                group = %self.group_name,
                policy = %name,
                "policy listed more than once, ignoring duplicate"
            );
            return;
        }

        self.pollers
            .push(MetricPoller::new(policy, node_selector, backends));
    }

    /// Whether any pollers were added.
    pub(crate) fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// Runs the manager until its stop token fires (clean shutdown) or a
    /// poller or scale request fails (error, caller re-enqueues the group).
    pub(crate) async fn run(self, stop: CancellationToken) -> Result<(), ControllerError> {
        // Buffered so a transient backlog at the scale manager does not
        // block pollers; a poller finding it full drops the alert.
        let (alert_tx, mut alert_rx) = mpsc::channel(self.pollers.len().max(1));
        let poller_stop = CancellationToken::new();

        let mut pollers = JoinSet::new();
        for poller in self.pollers {
            pollers.spawn(poller.run(alert_tx.clone(), poller_stop.clone()));
        }
        // The manager's own handle must not keep the channel open once
        // every poller is gone.
        drop(alert_tx);

        let result = loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!(group = %self.group_name, "poll manager shutting down");
                    break Ok(());
                }
                alert = alert_rx.recv() => {
                    let Some(alert) = alert else {
                        warn!(group = %self.group_name, "all pollers exited");
                        break Ok(());
                    };

                    match alert {
                        Alert::Failed(err) => break Err(err),
                        Alert::Fire { policy, direction, adjustment_type, adjustment_value } => {
                            let (reason, verb) = match direction {
                                ScaleDirection::Up => (events::SCALE_UP_ALERTED, "up"),
                                ScaleDirection::Down => (events::SCALE_DOWN_ALERTED, "down"),
                            };
                            self.recorder.event(
                                &policy,
                                EventType::Normal,
                                reason,
                                format!(
                                    "alert triggered to scale {verb} by {adjustment_value:.2} ({adjustment_type})"
                                ),
                            );

                            let (reply_tx, reply_rx) = oneshot::channel();
                            let request = ScaleRequest {
                                group: self.group_name.clone(),
                                direction,
                                adjustment_type,
                                adjustment_value,
                                ignore_cooldown: false,
                                reply: reply_tx,
                            };

                            if self.scale_requests.send(request).await.is_err() {
                                break Err(ControllerError::ScaleManagerUnavailable {
                                    group: self.group_name.clone(),
                                });
                            }

                            match reply_rx.await {
                                Ok(Ok(())) => {}
                                Ok(Err(err)) => {
                                    break Err(ControllerError::ScaleRequest {
                                        group: self.group_name.clone(),
                                        source: err,
                                    })
                                }
                                Err(_) => {
                                    break Err(ControllerError::ScaleManagerUnavailable {
                                        group: self.group_name.clone(),
                                    })
                                }
                            }
                        }
                    }
                }
            }
        };

        // However this manager exits, its pollers go with it.
        poller_stop.cancel();
        while pollers.join_next().await.is_some() {}
        info!(group = %self.group_name, "poll manager shut down");

        result
    }
}
