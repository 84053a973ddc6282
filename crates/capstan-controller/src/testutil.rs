//! Shared test doubles for the controller tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use capstan_api::{
    AdjustmentType, AutoscalingPolicy, AutoscalingPolicySpec, ObjectMeta, PolicySide,
    ScalingPolicy,
};
use capstan_engines::{Engine, EngineError};
use capstan_metrics::{Backend, MetricsError};

/// An engine that records every call and answers from a script.
#[derive(Debug)]
pub(crate) struct MockEngine {
    calls: Mutex<Vec<(BTreeMap<String, String>, u32, String)>>,
    scaled: bool,
    fail: bool,
}

impl MockEngine {
    /// Always scales successfully.
    pub(crate) fn scaling() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            scaled: true,
            fail: false,
        })
    }

    /// Always answers with a valid no-op.
    pub(crate) fn noop() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            scaled: false,
            fail: false,
        })
    }

    /// Always fails.
    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            scaled: true,
            fail: true,
        })
    }

    /// The calls observed so far: selector, desired count, strategy.
    pub(crate) fn calls(&self) -> Vec<(BTreeMap<String, String>, u32, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn set_target_node_count(
        &self,
        node_selector: &BTreeMap<String, String>,
        desired: u32,
        strategy: &str,
    ) -> Result<bool, EngineError> {
        self.calls
            .lock()
            .push((node_selector.clone(), desired, strategy.to_string()));

        if self.fail {
            return Err(EngineError::Provider {
                status: 502,
                message: "upstream unavailable".into(),
            });
        }
        Ok(self.scaled)
    }
}

#[derive(Clone, Debug)]
enum Sample {
    Value(f64),
    Fail(String),
}

/// A backend that serves a scripted sequence of samples, then a fallback.
#[derive(Debug)]
pub(crate) struct ScriptedBackend {
    script: Mutex<VecDeque<Sample>>,
    fallback: Sample,
}

impl ScriptedBackend {
    /// Serves the same value forever.
    pub(crate) fn constant(value: f64) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Sample::Value(value),
        })
    }

    /// Fails every sample.
    pub(crate) fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Sample::Fail(reason.into()),
        })
    }

    /// Serves `values` in order, then `fallback` forever.
    pub(crate) fn sequence(values: &[f64], fallback: f64) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(values.iter().copied().map(Sample::Value).collect()),
            fallback: Sample::Value(fallback),
        })
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn get_value(
        &self,
        _metric: &str,
        _configuration: &BTreeMap<String, String>,
        _node_selector: &BTreeMap<String, String>,
    ) -> Result<f64, MetricsError> {
        let sample = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match sample {
            Sample::Value(value) => Ok(value),
            Sample::Fail(reason) => Err(MetricsError::MalformedResponse { reason }),
        }
    }
}

/// A policy with an `>= 75` scale-up side and the given timings.
pub(crate) fn test_policy(
    name: &str,
    backend: &str,
    poll_interval: u32,
    sample_period: u32,
) -> AutoscalingPolicy {
    AutoscalingPolicy {
        metadata: ObjectMeta::named(name),
        spec: AutoscalingPolicySpec {
            metrics_backend: backend.into(),
            metric: "cpu_percent_utilization".into(),
            metric_configuration: BTreeMap::new(),
            poll_interval,
            sample_period,
            scaling_policy: ScalingPolicy {
                scale_up: Some(PolicySide {
                    threshold: 75.0,
                    comparison_operator: ">=".into(),
                    adjustment_type: AdjustmentType::Absolute,
                    adjustment_value: 2.0,
                }),
                scale_down: None,
            },
        },
    }
}
