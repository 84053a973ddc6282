//! Metric pollers: one sampler per (policy, node selector) pair.
//!
//! A poller ticks at the policy's poll interval, samples the metric, and
//! runs each configured side through a small state machine: a breach arms
//! the side, a breach sustained for the whole sample period fires exactly
//! one alert and rearms, and any non-breaching sample de-escalates
//! silently. A single breached sample never scales anything.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use capstan_api::{
    AdjustmentType, AutoscalingPolicy, ComparisonOperator, InvalidOperator, PolicySide,
    ScaleDirection,
};
use capstan_cluster::Registry;
use capstan_metrics::Backend;

use crate::error::ControllerError;

/// An internal message from a poller to its poll manager.
#[derive(Debug)]
pub(crate) enum Alert {
    /// A threshold was sustained for a full sample period.
    Fire {
        /// Policy that fired.
        policy: String,
        /// Direction to scale.
        direction: ScaleDirection,
        /// Adjustment the policy side declares.
        adjustment_type: AdjustmentType,
        /// Adjustment value the policy side declares.
        adjustment_value: f64,
    },
    /// The poller died; the manager shuts down and surfaces the error.
    Failed(ControllerError),
}

/// Per-direction alert state: `Idle` or armed since an instant.
#[derive(Debug, Default)]
pub(crate) struct AlertState {
    active: bool,
    since: Option<Instant>,
}

/// Runs one side of the policy state machine for a sampled value.
///
/// Returns whether an alert should fire now. Transitions:
/// breach & idle → armed; breach & armed & elapsed ≥ sample period → fire
/// and rearm; no breach → idle.
pub(crate) fn evaluate_side(
    side: Option<&PolicySide>,
    state: &mut AlertState,
    sample_period: Duration,
    value: f64,
    now: Instant,
) -> Result<bool, InvalidOperator> {
    let Some(side) = side else {
        return Ok(false);
    };

    let op: ComparisonOperator = side.comparison_operator.parse()?;
    if !op.evaluate(value, side.threshold) {
        // Breach over; de-escalate silently.
        state.active = false;
        return Ok(false);
    }

    if !state.active {
        state.active = true;
        state.since = Some(now);
        return Ok(false);
    }

    if state
        .since
        .is_some_and(|since| now.duration_since(since) >= sample_period)
    {
        // Sustained for the whole sample period: fire once, then rearm.
        state.active = false;
        return Ok(true);
    }

    Ok(false)
}

/// Samples one policy's metric for one group.
pub(crate) struct MetricPoller {
    policy: AutoscalingPolicy,
    node_selector: BTreeMap<String, String>,
    backends: Arc<Registry<dyn Backend>>,
}

impl MetricPoller {
    pub(crate) fn new(
        policy: AutoscalingPolicy,
        node_selector: BTreeMap<String, String>,
        backends: Arc<Registry<dyn Backend>>,
    ) -> Self {
        Self {
            policy,
            node_selector,
            backends,
        }
    }

    /// Runs until the stop token fires or the poller hits a terminating
    /// error, which it reports as a final [`Alert::Failed`].
    pub(crate) async fn run(self, alerts: mpsc::Sender<Alert>, stop: CancellationToken) {
        let spec = &self.policy.spec;
        let poll_interval = Duration::from_secs(u64::from(spec.poll_interval.max(1)));
        let sample_period = Duration::from_secs(u64::from(spec.sample_period));
        let policy_name = self.policy.metadata.name.clone();

        let mut up_state = AlertState::default();
        let mut down_state = AlertState::default();

        let mut ticker = tokio::time::interval(poll_interval);
        // The interval's first tick completes immediately; sampling starts
        // one full interval in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!(policy = %policy_name, "poller shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            // The stop signal is checked per tick, never held across the
            // backend call.
            let backend = match self.backends.get(&spec.metrics_backend) {
                Ok(backend) => backend,
                Err(err) => {
                    let failure = ControllerError::BackendUnavailable {
                        backend: spec.metrics_backend.clone(),
                        policy: policy_name.clone(),
                        source: err,
                    };
                    let _ = alerts.send(Alert::Failed(failure)).await;
                    return;
                }
            };

            let value = match backend
                .get_value(&spec.metric, &spec.metric_configuration, &self.node_selector)
                .await
            {
                Ok(value) => value,
                Err(err) => {
                    let failure = ControllerError::MetricFetch {
                        metric: spec.metric.clone(),
                        policy: policy_name.clone(),
                        source: err,
                    };
                    let _ = alerts.send(Alert::Failed(failure)).await;
                    return;
                }
            };

            debug!(policy = %policy_name, value, "sampled metric");
            let now = Instant::now();

            let sides = [
                (
                    ScaleDirection::Up,
                    spec.scaling_policy.scale_up.as_ref(),
                    &mut up_state,
                ),
                (
                    ScaleDirection::Down,
                    spec.scaling_policy.scale_down.as_ref(),
                    &mut down_state,
                ),
            ];

            for (direction, side, state) in sides {
                match evaluate_side(side, state, sample_period, value, now) {
                    Ok(false) => {}
                    Ok(true) => {
                        let Some(side) = side else { continue };
                        let alert = Alert::Fire {
                            policy: policy_name.clone(),
                            direction,
                            adjustment_type: side.adjustment_type,
                            adjustment_value: side.adjustment_value,
                        };
                        match alerts.try_send(alert) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                // Never block sampling on a stuck manager.
                                warn!(
                                    policy = %policy_name,
                                    %direction,
                                    "alert channel full, dropping alert"
                                );
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                    Err(err) => {
                        let failure = ControllerError::InvalidPolicyOperator {
                            policy: policy_name.clone(),
                            source: err,
                        };
                        let _ = alerts.send(Alert::Failed(failure)).await;
                        return;
                    }
                }
            }
        }
    }
}
