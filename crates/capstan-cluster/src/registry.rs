//! Process-wide plugin registries.
//!
//! The engine and backend reconcilers keep these tables in sync with the
//! declarative resources; pollers and the scale manager look entries up by
//! name on every use. Entries are shared `Arc`s: a reader that obtained an
//! entry may keep using it briefly after a concurrent delete or replace.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ClusterError;

/// A thread-safe name → plugin table.
///
/// Create one per plugin kind before any reconciler starts and share it by
/// `Arc`; the interior lock is never exposed.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    items: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> Registry<T> {
    /// Creates an empty registry. `kind` names the entry kind in errors.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts an entry, overwriting any previous entry with the same name.
    pub fn put(&self, name: impl Into<String>, item: Arc<T>) {
        self.items.write().insert(name.into(), item);
    }

    /// Returns the named entry.
    ///
    /// The entry is not guaranteed to still be registered by the time the
    /// caller uses it; callers handle entry errors and retry.
    ///
    /// # Errors
    ///
    /// [`ClusterError::NotFound`] when no entry has that name.
    pub fn get(&self, name: &str) -> Result<Arc<T>, ClusterError> {
        self.items
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    /// Removes the named entry. Removing an absent entry is a no-op; the
    /// entry itself is not torn down.
    pub fn delete(&self, name: &str) {
        self.items.write().remove(name);
    }

    /// Whether an entry with the given name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.items.read().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let registry: Registry<str> = Registry::new("engine");
        registry.put("a", Arc::from("engine-a"));

        let entry = registry.get("a").expect("entry");
        assert_eq!(&*entry, "engine-a");
        assert!(registry.contains("a"));
    }

    #[test]
    fn get_missing_is_not_found() {
        let registry: Registry<str> = Registry::new("engine");
        let err = registry.get("nope").unwrap_err();
        assert_eq!(
            err,
            ClusterError::NotFound {
                kind: "engine",
                name: "nope".into()
            }
        );
    }

    #[test]
    fn put_overwrites() {
        let registry: Registry<str> = Registry::new("backend");
        registry.put("a", Arc::from("one"));
        registry.put("a", Arc::from("two"));

        assert_eq!(&*registry.get("a").expect("entry"), "two");
    }

    #[test]
    fn delete_is_idempotent() {
        let registry: Registry<str> = Registry::new("backend");
        registry.put("a", Arc::from("one"));

        registry.delete("a");
        registry.delete("a");
        assert!(registry.get("a").is_err());
        assert!(!registry.contains("a"));
    }

    #[test]
    fn deleted_entries_stay_usable_for_holders() {
        let registry: Registry<str> = Registry::new("engine");
        registry.put("a", Arc::from("held"));

        let held = registry.get("a").expect("entry");
        registry.delete("a");
        assert_eq!(&*held, "held");
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let registry: Arc<Registry<String>> = Arc::new(Registry::new("engine"));
        let mut handles = Vec::new();

        for worker in 0..4 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let name = format!("e{}", i % 8);
                    registry.put(&name, Arc::new(format!("{worker}:{i}")));
                    let _ = registry.get(&name);
                    if i % 3 == 0 {
                        registry.delete(&name);
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().expect("worker");
        }
    }
}
