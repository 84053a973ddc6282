//! The AutoscalingGroup resource: a label-selected set of nodes with min/max
//! bounds, a target engine, and attached scaling policies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::meta::{ObjectMeta, Resource};
use crate::scale::ScaleDirection;

/// A named, label-selected group of worker nodes to keep between bounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingGroup {
    /// Resource metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    pub spec: AutoscalingGroupSpec,
    /// Controller-owned state.
    #[serde(default)]
    pub status: AutoscalingGroupStatus,
}

/// Desired state of an [`AutoscalingGroup`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingGroupSpec {
    /// Nodes belong to this group when their labels carry every pair listed
    /// here. An empty selector matches every node.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Names of the AutoscalingPolicies attached to this group. Duplicate
    /// entries are ignored.
    #[serde(default)]
    pub policies: Vec<String>,
    /// Name of the AutoscalingEngine that actuates this group.
    pub engine: String,
    /// Minimum wall-clock seconds between successful scale operations.
    #[serde(default)]
    pub cooldown_period: u32,
    /// When set, both bounds enforcement and policy scaling leave the group
    /// alone.
    #[serde(default)]
    pub suspended: bool,
    /// Lower node count bound.
    #[serde(default)]
    pub min_nodes: u32,
    /// Upper node count bound.
    #[serde(default)]
    pub max_nodes: u32,
    /// Optional engine-specific strategy names per direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling_strategy: Option<ScalingStrategy>,
}

/// Engine-specific strategy names, one per scale direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingStrategy {
    /// Strategy used when adding nodes.
    #[serde(default)]
    pub scale_up: Option<String>,
    /// Strategy used when removing nodes.
    #[serde(default)]
    pub scale_down: Option<String>,
}

/// Controller-owned status of an [`AutoscalingGroup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingGroupStatus {
    /// When the scale manager last actuated this group. Unset until the
    /// first successful scale, which also means the group is never in
    /// cooldown before then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl AutoscalingGroup {
    /// Validates the group's spec.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidBounds`] when `minNodes` exceeds
    /// `maxNodes`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.spec.min_nodes > self.spec.max_nodes {
            return Err(ValidationError::InvalidBounds {
                min: self.spec.min_nodes,
                max: self.spec.max_nodes,
            });
        }
        Ok(())
    }

    /// The strategy configured for the given direction. An empty string
    /// means the engine should apply its own default.
    #[must_use]
    pub fn strategy_for(&self, direction: ScaleDirection) -> String {
        let Some(strategy) = &self.spec.scaling_strategy else {
            return String::new();
        };

        let side = match direction {
            ScaleDirection::Up => &strategy.scale_up,
            ScaleDirection::Down => &strategy.scale_down,
        };
        side.clone().unwrap_or_default()
    }
}

impl Resource for AutoscalingGroup {
    const KIND: &'static str = "AutoscalingGroup";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec_changed(&self, old: &Self) -> bool {
        self.spec != old.spec
    }

    fn retain_status(&mut self, old: &Self) {
        self.status = old.status.clone();
    }
}
