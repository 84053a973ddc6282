//! The policy watcher: starts and stops poll managers as groups and
//! policies change.
//!
//! Every sync replaces the group's poll manager wholesale instead of
//! updating it in place; the rebuild is cheap and guarantees clean poller
//! state after any spec change.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use capstan_api::{AutoscalingGroup, AutoscalingPolicy};
use capstan_cluster::{EventRecorder, Registry, Store, WatchEvent, WorkQueue};
use capstan_metrics::Backend;

use crate::error::ControllerError;
use crate::poll_manager::PollManager;
use crate::reconcile::Reconciler;
use crate::scale::ScaleRequest;

/// Component name used in logs and events.
pub const METRICS_CONTROLLER_NAME: &str = "MetricsController";

const MAX_REQUEUES: u32 = 10;

struct PollManagerHandle {
    stop: CancellationToken,
}

/// Owns one poll manager per active group.
pub struct MetricsController {
    groups: Arc<Store<AutoscalingGroup>>,
    policies: Arc<Store<AutoscalingPolicy>>,
    backends: Arc<Registry<dyn Backend>>,
    recorder: EventRecorder,
    scale_requests: mpsc::Sender<ScaleRequest>,
    queue: Arc<WorkQueue>,
    managers: Mutex<HashMap<String, PollManagerHandle>>,
    // Parent of every manager's stop token, cancelled on shutdown.
    managers_stop: CancellationToken,
}

impl MetricsController {
    /// Creates the controller.
    #[must_use]
    pub fn new(
        groups: Arc<Store<AutoscalingGroup>>,
        policies: Arc<Store<AutoscalingPolicy>>,
        backends: Arc<Registry<dyn Backend>>,
        recorder: EventRecorder,
        scale_requests: mpsc::Sender<ScaleRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            groups,
            policies,
            backends,
            recorder,
            scale_requests,
            queue: WorkQueue::new(),
            managers: Mutex::new(HashMap::new()),
            managers_stop: CancellationToken::new(),
        })
    }

    /// Runs the controller until the shutdown token fires; all poll
    /// managers are stopped on the way out.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut group_events = self.groups.subscribe();
        let mut policy_events = self.policies.subscribe();

        info!(controller = METRICS_CONTROLLER_NAME, "starting controller");

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
                                    controller = METRICS_CONTROLLER_NAME,
                                    missed,
                                    "lagged behind group watch"
                                );
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                this.queue.shut_down();
                                return;
                            }
                        },
                        event = policy_events.recv() => match event {
                            Ok(event) => this.on_policy_event(&event),
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(
                                    controller = METRICS_CONTROLLER_NAME,
                                    missed,
                                    "lagged behind policy watch"
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

        // Stopping the watcher stops every poll manager it owns.
        self.managers_stop.cancel();
        info!(controller = METRICS_CONTROLLER_NAME, "shut down");
    }

    fn on_group_event(&self, event: WatchEvent<AutoscalingGroup>) {
        match event {
            WatchEvent::Added(group) | WatchEvent::Deleted(group) => {
                self.queue.add(&group.metadata.name);
            }
            WatchEvent::Modified { old, new } => {
                if new.metadata.generation != old.metadata.generation {
                    self.queue.add(&new.metadata.name);
                }
            }
        }
    }

    /// A policy change re-syncs every group that lists the policy.
    fn on_policy_event(&self, event: &WatchEvent<AutoscalingPolicy>) {
        let policy_name = match event {
            WatchEvent::Added(policy) | WatchEvent::Deleted(policy) => &policy.metadata.name,
            WatchEvent::Modified { new, .. } => &new.metadata.name,
        };

        for group in self.groups.list() {
            if group.spec.policies.iter().any(|name| name == policy_name) {
                debug!(
                    controller = METRICS_CONTROLLER_NAME,
                    group = %group.metadata.name,
                    policy = %policy_name,
                    "enqueueing group for policy change"
                );
                self.queue.add(&group.metadata.name);
            }
        }
    }

    fn teardown(&self, group_name: &str) {
        if let Some(handle) = self.managers.lock().remove(group_name) {
            debug!(
                controller = METRICS_CONTROLLER_NAME,
                group = %group_name,
                "stopping poll manager"
            );
            handle.stop.cancel();
        }
    }

    /// Number of live poll manager handles, for tests and introspection.
    #[must_use]
    pub fn manager_count(&self) -> usize {
        self.managers.lock().len()
    }
}

#[async_trait]
impl Reconciler for MetricsController {
    fn name(&self) -> &'static str {
        METRICS_CONTROLLER_NAME
    }

    fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    fn max_requeues(&self) -> u32 {
        MAX_REQUEUES
    }

    async fn sync(&self, key: &str) -> Result<(), ControllerError> {
        let Some(group) = self.groups.get(key) else {
            info!(
                controller = METRICS_CONTROLLER_NAME,
                group = %key,
                "group was deleted, cleaning up its poll manager"
            );
            self.teardown(key);
            return Ok(());
        };

        // Replace-on-change: any existing manager is stale by definition.
        self.teardown(key);

        if group.spec.suspended {
            info!(
                controller = METRICS_CONTROLLER_NAME,
                group = %key,
                "group is suspended, not polling"
            );
            return Ok(());
        }

        if group.spec.policies.is_empty() {
            warn!(
                controller = METRICS_CONTROLLER_NAME,
                group = %key,
                "group has no policies, not polling"
            );
            return Ok(());
        }

        let mut manager =
            PollManager::new(key, self.recorder.clone(), self.scale_requests.clone());
        for policy_name in &group.spec.policies {
            match self.policies.get(policy_name) {
                Some(policy) => manager.add_poller(
                    policy,
                    group.spec.node_selector.clone(),
                    Arc::clone(&self.backends),
                ),
                None => warn!(
                    controller = METRICS_CONTROLLER_NAME,
                    group = %key,
                    policy = %policy_name,
                    "policy referenced by group does not exist, skipping"
                ),
            }
        }

        if manager.is_empty() {
            warn!(
                controller = METRICS_CONTROLLER_NAME,
                group = %key,
                "none of the referenced policies exist, nothing to poll"
            );
            return Ok(());
        }

        let stop = self.managers_stop.child_token();
        self.managers.lock().insert(
            key.to_string(),
            PollManagerHandle { stop: stop.clone() },
        );

        let queue = Arc::clone(&self.queue);
        let group_name = key.to_string();
        tokio::spawn(async move {
            debug!(group = %group_name, "starting poll manager");
            if let Err(err) = manager.run(stop).await {
                // Unexpected manager death: requeue the group so it is
                // rebuilt with backoff.
                error!(group = %group_name, error = %err, "poll manager died");
                queue.add_rate_limited(&group_name);
            }
        });

        Ok(())
    }
}
