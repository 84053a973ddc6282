//! Object metadata shared by every declarative resource.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata carried by every declarative resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Cluster-unique resource name.
    pub name: String,
    /// Arbitrary key/value labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Incremented only when the spec portion of the resource changes.
    #[serde(default)]
    pub generation: u64,
    /// Incremented on every write, including status updates.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    /// Creates metadata with the given name and no labels.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a label, builder style.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A declarative resource that can live in a watchable store.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Resource kind, used in logs, errors and events.
    const KIND: &'static str;

    /// The resource's metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Mutable access to the resource's metadata.
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Whether the spec portion differs from `old`. Status-only writes must
    /// return false so the generation is not bumped for them.
    fn spec_changed(&self, old: &Self) -> bool;

    /// Carries forward any status written by the controllers when a new spec
    /// revision of the resource replaces `old` in a store. The default is a
    /// no-op for resources without controller-owned status.
    fn retain_status(&mut self, _old: &Self) {}

    /// The resource name.
    fn name(&self) -> &str {
        &self.meta().name
    }
}
