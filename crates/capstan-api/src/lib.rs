//! Declarative resource model for the capstan autoscaler.
//!
//! This crate defines the four resource kinds the controllers reconcile —
//! [`AutoscalingGroup`], [`AutoscalingPolicy`], [`MetricsBackend`] and
//! [`AutoscalingEngine`] — together with the observed [`Node`] and [`Pod`]
//! types, the comparison operator vocabulary, and the event reason constants
//! recorded by the controllers.

#![forbid(unsafe_code)]

mod compare;
mod error;
pub mod events;
mod group;
mod meta;
mod node;
mod plugin;
mod policy;
mod scale;

pub use compare::ComparisonOperator;
pub use error::{InvalidOperator, ValidationError};
pub use group::{AutoscalingGroup, AutoscalingGroupSpec, AutoscalingGroupStatus, ScalingStrategy};
pub use meta::{ObjectMeta, Resource};
pub use node::{ContainerSpec, Node, Pod, PodPhase, ResourceCapacity, GPU_VENDOR_RESOURCES, HOSTNAME_LABEL};
pub use plugin::{AutoscalingEngine, MetricsBackend, PluginSpec};
pub use policy::{AutoscalingPolicy, AutoscalingPolicySpec, PolicySide, ScalingPolicy};
pub use scale::{AdjustmentType, ScaleDirection};
