//! Typed, watchable object stores.
//!
//! A [`Store`] is the in-process equivalent of a synced informer cache: it
//! holds the current set of objects of one resource kind and broadcasts a
//! [`WatchEvent`] for every change. Controllers subscribe before starting
//! their workers and treat the store contents as authoritative.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::warn;

use capstan_api::Resource;

use crate::error::ClusterError;
use crate::selector::selector_matches;

/// Watch channel capacity. A lagging subscriber loses the oldest events and
/// is expected to recover on the next resync.
const WATCH_CAPACITY: usize = 256;

/// A change notification from a [`Store`].
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    /// The object was created.
    Added(T),
    /// The object was updated.
    Modified {
        /// State before the write.
        old: T,
        /// State after the write.
        new: T,
    },
    /// The object was removed.
    Deleted(T),
}

/// A typed object store with watch semantics.
pub struct Store<T: Resource> {
    objects: RwLock<HashMap<String, T>>,
    watch: broadcast::Sender<WatchEvent<T>>,
}

impl<T: Resource> Store<T> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (watch, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            watch,
        }
    }

    /// Subscribes to change notifications. Events emitted before the call
    /// are not replayed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.watch.subscribe()
    }

    /// Creates the object or updates it in place.
    ///
    /// On update, the generation is bumped only when the spec portion
    /// changed, controller-owned status is carried over from the stored
    /// object, and the resource version is always bumped.
    pub fn apply(&self, mut obj: T) {
        let name = obj.name().to_string();
        if name.is_empty() {
            warn!(kind = T::KIND, "ignoring object without a name");
            return;
        }

        let event = {
            let mut objects = self.objects.write();
            match objects.get(&name) {
                Some(old) => {
                    let spec_changed = obj.spec_changed(old);
                    let old_generation = old.meta().generation;
                    let old_resource_version = old.meta().resource_version;
                    let meta = obj.meta_mut();
                    meta.resource_version = old_resource_version + 1;
                    meta.generation = if spec_changed {
                        old_generation + 1
                    } else {
                        old_generation
                    };
                    obj.retain_status(old);

                    let old = old.clone();
                    objects.insert(name, obj.clone());
                    WatchEvent::Modified { old, new: obj }
                }
                None => {
                    let meta = obj.meta_mut();
                    meta.generation = 1;
                    meta.resource_version = 1;
                    objects.insert(name, obj.clone());
                    WatchEvent::Added(obj)
                }
            }
        };

        let _ = self.watch.send(event);
    }

    /// Applies a status mutation with optimistic concurrency: the write is
    /// rejected when the stored resource version no longer matches
    /// `expected_version`. The generation is left untouched.
    ///
    /// # Errors
    ///
    /// [`ClusterError::NotFound`] when the object is gone,
    /// [`ClusterError::Conflict`] when it was written concurrently.
    pub fn update_status(
        &self,
        name: &str,
        expected_version: u64,
        mutate: impl FnOnce(&mut T),
    ) -> Result<T, ClusterError> {
        let (old, updated) = {
            let mut objects = self.objects.write();
            let Some(current) = objects.get_mut(name) else {
                return Err(ClusterError::NotFound {
                    kind: T::KIND,
                    name: name.to_string(),
                });
            };

            let found = current.meta().resource_version;
            if found != expected_version {
                return Err(ClusterError::Conflict {
                    kind: T::KIND,
                    name: name.to_string(),
                    expected: expected_version,
                    found,
                });
            }

            let old = current.clone();
            mutate(current);
            current.meta_mut().resource_version = found + 1;
            (old, current.clone())
        };

        let _ = self.watch.send(WatchEvent::Modified {
            old,
            new: updated.clone(),
        });
        Ok(updated)
    }

    /// Removes the object, returning it if it existed.
    pub fn delete(&self, name: &str) -> Option<T> {
        let removed = self.objects.write().remove(name);
        if let Some(obj) = &removed {
            let _ = self.watch.send(WatchEvent::Deleted(obj.clone()));
        }
        removed
    }

    /// Returns a copy of the named object.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<T> {
        self.objects.read().get(name).cloned()
    }

    /// Returns copies of every stored object.
    #[must_use]
    pub fn list(&self) -> Vec<T> {
        self.objects.read().values().cloned().collect()
    }

    /// Returns copies of the objects whose labels satisfy `selector`.
    #[must_use]
    pub fn list_selected(&self, selector: &BTreeMap<String, String>) -> Vec<T> {
        self.objects
            .read()
            .values()
            .filter(|obj| selector_matches(selector, &obj.meta().labels))
            .cloned()
            .collect()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl<T: Resource> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use capstan_api::{AutoscalingGroup, AutoscalingGroupSpec, Node, ObjectMeta};
    use chrono::Utc;

    fn group(name: &str, min: u32, max: u32) -> AutoscalingGroup {
        AutoscalingGroup {
            metadata: ObjectMeta::named(name),
            spec: AutoscalingGroupSpec {
                engine: "e1".into(),
                min_nodes: min,
                max_nodes: max,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn node(name: &str, pool: &str) -> Node {
        Node {
            metadata: ObjectMeta::named(name).with_label("pool", pool),
            ..Default::default()
        }
    }

    mod apply {
        use super::*;

        #[test]
        fn create_sets_initial_versions() {
            let store = Store::new();
            store.apply(group("g", 1, 5));

            let stored = store.get("g").expect("stored");
            assert_eq!(stored.metadata.generation, 1);
            assert_eq!(stored.metadata.resource_version, 1);
        }

        #[test]
        fn spec_change_bumps_generation() {
            let store = Store::new();
            store.apply(group("g", 1, 5));
            store.apply(group("g", 1, 8));

            let stored = store.get("g").expect("stored");
            assert_eq!(stored.metadata.generation, 2);
            assert_eq!(stored.metadata.resource_version, 2);
        }

        #[test]
        fn identical_spec_keeps_generation() {
            let store = Store::new();
            store.apply(group("g", 1, 5));
            store.apply(group("g", 1, 5));

            let stored = store.get("g").expect("stored");
            assert_eq!(stored.metadata.generation, 1);
            assert_eq!(stored.metadata.resource_version, 2);
        }

        #[test]
        fn reapply_preserves_controller_status() {
            let store = Store::new();
            store.apply(group("g", 1, 5));

            let version = store.get("g").expect("stored").metadata.resource_version;
            store
                .update_status("g", version, |g| {
                    g.status.last_updated_at = Some(Utc::now());
                })
                .expect("status update");

            store.apply(group("g", 1, 8));
            let stored = store.get("g").expect("stored");
            assert!(stored.status.last_updated_at.is_some());
        }
    }

    mod status {
        use super::*;

        #[test]
        fn update_status_bumps_version_not_generation() {
            let store = Store::new();
            store.apply(group("g", 1, 5));

            let updated = store
                .update_status("g", 1, |g| {
                    g.status.last_updated_at = Some(Utc::now());
                })
                .expect("status update");

            assert_eq!(updated.metadata.generation, 1);
            assert_eq!(updated.metadata.resource_version, 2);
        }

        #[test]
        fn stale_version_conflicts() {
            let store = Store::new();
            store.apply(group("g", 1, 5));
            store.apply(group("g", 1, 8));

            let err = store
                .update_status("g", 1, |g| {
                    g.status.last_updated_at = Some(Utc::now());
                })
                .unwrap_err();

            assert!(matches!(
                err,
                ClusterError::Conflict {
                    expected: 1,
                    found: 2,
                    ..
                }
            ));
        }

        #[test]
        fn missing_object_is_not_found() {
            let store: Store<AutoscalingGroup> = Store::new();
            let err = store.update_status("missing", 1, |_| {}).unwrap_err();
            assert!(matches!(err, ClusterError::NotFound { .. }));
        }
    }

    mod watch {
        use super::*;

        #[tokio::test]
        async fn apply_and_delete_emit_events() {
            let store = Store::new();
            let mut events = store.subscribe();

            store.apply(group("g", 1, 5));
            store.apply(group("g", 1, 8));
            store.delete("g");

            assert!(matches!(events.recv().await, Ok(WatchEvent::Added(_))));
            match events.recv().await {
                Ok(WatchEvent::Modified { old, new }) => {
                    assert_eq!(old.spec.max_nodes, 5);
                    assert_eq!(new.spec.max_nodes, 8);
                }
                other => panic!("expected Modified, got {other:?}"),
            }
            assert!(matches!(events.recv().await, Ok(WatchEvent::Deleted(_))));
        }

        #[tokio::test]
        async fn delete_of_missing_object_is_silent() {
            let store: Store<AutoscalingGroup> = Store::new();
            let mut events = store.subscribe();

            assert!(store.delete("missing").is_none());
            store.apply(group("g", 1, 5));

            // The only event observed is the add; the failed delete emitted
            // nothing.
            assert!(matches!(events.recv().await, Ok(WatchEvent::Added(_))));
        }
    }

    mod listing {
        use super::*;
        use std::collections::BTreeMap;

        #[test]
        fn list_selected_applies_selector() {
            let store = Store::new();
            store.apply(node("n1", "a"));
            store.apply(node("n2", "a"));
            store.apply(node("n3", "b"));

            let selector = BTreeMap::from([("pool".to_string(), "a".to_string())]);
            let mut names: Vec<_> = store
                .list_selected(&selector)
                .into_iter()
                .map(|n| n.metadata.name)
                .collect();
            names.sort();
            assert_eq!(names, ["n1", "n2"]);

            let empty = BTreeMap::new();
            assert_eq!(store.list_selected(&empty).len(), 3);
        }
    }
}
