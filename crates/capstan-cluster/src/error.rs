//! Error types for the cluster substrate.

use thiserror::Error;

/// Errors surfaced by stores and registries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// A named object or registry entry does not exist.
    #[error("{kind} {name:?} does not exist")]
    NotFound {
        /// Kind of the missing object.
        kind: &'static str,
        /// Name of the missing object.
        name: String,
    },

    /// An optimistic status update lost against a concurrent write.
    #[error("conflicting write to {kind} {name:?}: expected version {expected}, found {found}")]
    Conflict {
        /// Kind of the contended object.
        kind: &'static str,
        /// Name of the contended object.
        name: String,
        /// Version the writer based its update on.
        expected: u64,
        /// Version actually found in the store.
        found: u64,
    },
}
