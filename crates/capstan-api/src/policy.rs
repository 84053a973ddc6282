//! The AutoscalingPolicy resource: a metric-driven rule declaring when to
//! raise a scale alert.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::compare::ComparisonOperator;
use crate::error::ValidationError;
use crate::meta::{ObjectMeta, Resource};
use crate::scale::AdjustmentType;

/// A named metric-driven scaling rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingPolicy {
    /// Resource metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    pub spec: AutoscalingPolicySpec,
}

/// Desired state of an [`AutoscalingPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingPolicySpec {
    /// Name of the MetricsBackend to sample.
    pub metrics_backend: String,
    /// Backend-specific metric name.
    pub metric: String,
    /// Backend-specific metric configuration; unknown keys are ignored by
    /// the backend.
    #[serde(default)]
    pub metric_configuration: BTreeMap<String, String>,
    /// Seconds between samples.
    pub poll_interval: u32,
    /// Minimum sustained-breach seconds before an alert fires.
    pub sample_period: u32,
    /// Threshold configuration per direction.
    #[serde(default)]
    pub scaling_policy: ScalingPolicy,
}

/// Per-direction threshold configuration. At least one side must be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicy {
    /// Fires scale up alerts when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up: Option<PolicySide>,
    /// Fires scale down alerts when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down: Option<PolicySide>,
}

/// One direction of a scaling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySide {
    /// Value the sampled metric is compared against.
    pub threshold: f64,
    /// Comparison operator symbol, one of `>` `<` `>=` `<=` `==` `!=`.
    pub comparison_operator: String,
    /// How the adjustment value is applied.
    pub adjustment_type: AdjustmentType,
    /// Node count or percentage, per the adjustment type.
    pub adjustment_value: f64,
}

impl AutoscalingPolicy {
    /// Validates the policy's spec: positive intervals, at least one side,
    /// and parseable operators.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.spec.poll_interval == 0 {
            return Err(ValidationError::NonPositiveInterval {
                field: "pollInterval",
            });
        }
        if self.spec.sample_period == 0 {
            return Err(ValidationError::NonPositiveInterval {
                field: "samplePeriod",
            });
        }

        let policy = &self.spec.scaling_policy;
        if policy.scale_up.is_none() && policy.scale_down.is_none() {
            return Err(ValidationError::MissingPolicySide);
        }

        for side in [&policy.scale_up, &policy.scale_down].into_iter().flatten() {
            side.comparison_operator.parse::<ComparisonOperator>()?;
        }

        Ok(())
    }
}

impl Resource for AutoscalingPolicy {
    const KIND: &'static str = "AutoscalingPolicy";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec_changed(&self, old: &Self) -> bool {
        self.spec != old.spec
    }
}
