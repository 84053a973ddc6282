//! The MetricsBackend and AutoscalingEngine resources. Both declare a typed
//! plugin instance by name: a `type` string choosing the implementation and
//! an opaque configuration map the implementation parses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::{ObjectMeta, Resource};

/// The shared spec shape of both plugin resource kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Chooses the implementation to instantiate.
    #[serde(rename = "type")]
    pub kind: String,
    /// Implementation-specific configuration. Each implementation parses its
    /// recognized keys and ignores the rest.
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
}

/// A named source of metrics for autoscaling policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsBackend {
    /// Resource metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    pub spec: PluginSpec,
}

/// A named cloud/infra actuator that can set a node group's target count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalingEngine {
    /// Resource metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    pub spec: PluginSpec,
}

impl Resource for MetricsBackend {
    const KIND: &'static str = "MetricsBackend";

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

impl Resource for AutoscalingEngine {
    const KIND: &'static str = "AutoscalingEngine";

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
