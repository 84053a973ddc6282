//! Observed cluster inventory: nodes and the pods scheduled onto them.
//! These types are read-only to the autoscaler; the inventory is maintained
//! externally and served from the cluster state store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::{ObjectMeta, Resource};

/// Label carrying a node's hostname as known to external metric systems.
pub const HOSTNAME_LABEL: &str = "capstan.io/hostname";

/// Vendor resource names summed by GPU allocation accounting.
pub const GPU_VENDOR_RESOURCES: [&str; 2] = ["amd.com/gpu", "nvidia.com/gpu"];

/// A worker node observed in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Resource metadata; group membership is decided by the labels here.
    pub metadata: ObjectMeta,
    /// Provider-specific node identifier.
    #[serde(default)]
    pub provider_id: String,
    /// Resources available for allocation on this node.
    #[serde(default)]
    pub allocatable: ResourceCapacity,
}

/// Fixed-point resource quantities in milli-units.
///
/// Milli-unit i64 arithmetic overflows above ~9.2e18 milli-units of a single
/// resource, far beyond any cluster this accounting is meant for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCapacity {
    /// CPU in millicores.
    #[serde(default)]
    pub cpu_millis: i64,
    /// Memory in milli-bytes.
    #[serde(default)]
    pub memory_millis: i64,
    /// Ephemeral storage in milli-bytes.
    #[serde(default)]
    pub ephemeral_storage_millis: i64,
    /// Pod slots (whole units).
    #[serde(default)]
    pub pods: i64,
    /// GPUs in milli-units, keyed by vendor resource name.
    #[serde(default)]
    pub gpus: BTreeMap<String, i64>,
}

/// A pod observed on a node, carried for allocation accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    /// Resource metadata.
    pub metadata: ObjectMeta,
    /// Name of the node this pod is scheduled onto; empty while pending.
    #[serde(default)]
    pub node_name: String,
    /// Lifecycle phase.
    #[serde(default)]
    pub phase: PodPhase,
    /// Containers and their resource requests.
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

/// Pod lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    /// Scheduled but not yet running.
    #[default]
    Pending,
    /// Running on its node.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failure.
    Failed,
}

impl PodPhase {
    /// Terminal pods no longer count toward node allocation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A container and its resource requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Requested resources, in milli-units.
    #[serde(default)]
    pub requests: ResourceCapacity,
}

impl Resource for Node {
    const KIND: &'static str = "Node";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec_changed(&self, old: &Self) -> bool {
        self.provider_id != old.provider_id
            || self.allocatable != old.allocatable
            || self.metadata.labels != old.metadata.labels
    }
}

impl Resource for Pod {
    const KIND: &'static str = "Pod";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec_changed(&self, old: &Self) -> bool {
        self.node_name != old.node_name
            || self.phase != old.phase
            || self.containers != old.containers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases() {
        assert!(!PodPhase::Pending.is_terminal());
        assert!(!PodPhase::Running.is_terminal());
        assert!(PodPhase::Succeeded.is_terminal());
        assert!(PodPhase::Failed.is_terminal());
    }

    #[test]
    fn node_defaults_deserialize() {
        let node: Node = serde_json::from_str(r#"{"metadata":{"name":"n1"}}"#).expect("parse");
        assert_eq!(node.metadata.name, "n1");
        assert_eq!(node.provider_id, "");
        assert_eq!(node.allocatable.cpu_millis, 0);
    }

    #[test]
    fn label_change_counts_as_spec_change() {
        let old = Node {
            metadata: ObjectMeta::named("n1").with_label("pool", "a"),
            ..Default::default()
        };
        let mut new = old.clone();
        assert!(!new.spec_changed(&old));

        new.metadata.labels.insert("pool".into(), "b".into());
        assert!(new.spec_changed(&old));
    }
}
