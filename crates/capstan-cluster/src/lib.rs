//! Cluster state substrate for the capstan autoscaler.
//!
//! The controllers in `capstan-controller` are written against the small set
//! of primitives in this crate rather than against any particular cluster
//! API:
//!
//! - [`Store`]: a typed, watchable object cache with optimistic status
//!   updates
//! - [`WorkQueue`]: a per-item dedup queue with exponential-backoff requeues
//! - [`EventRecorder`]: component-tagged event emission
//! - [`Registry`]: the process-wide name → plugin tables for engines and
//!   metrics backends

#![forbid(unsafe_code)]

mod error;
mod events;
mod queue;
mod registry;
mod selector;
mod store;

pub use error::ClusterError;
pub use events::{Event, EventRecorder, EventType};
pub use queue::WorkQueue;
pub use registry::Registry;
pub use selector::selector_matches;
pub use store::{Store, WatchEvent};
