//! Reconcilers, pollers and the scale manager for the capstan autoscaler.
//!
//! The controllers in this crate consume the watch streams of the cluster
//! state stores and drive every autoscaling group toward its declared
//! bounds and policies:
//!
//! - [`GroupController`] enforces each group's `[min, max]` node bounds.
//! - [`MetricsController`] owns one poll manager per active group; each
//!   manager samples the group's policies and turns sustained threshold
//!   breaches into scale requests.
//! - [`ScaleManager`] serializes every scale decision, applies cooldown and
//!   adjustment arithmetic, calls the engine, and writes group status.
//! - [`engine_controller`] and [`backend_controller`] keep the plugin
//!   registries in sync with their declarative resources.

#![forbid(unsafe_code)]

mod bounds;
mod error;
mod plugins;
mod poll_manager;
mod poller;
mod policy_watcher;
mod reconcile;
mod scale;
#[cfg(test)]
mod testutil;

pub use bounds::{GroupController, GROUP_CONTROLLER_NAME};
pub use error::{ControllerError, ScaleError};
pub use plugins::{
    backend_controller, engine_controller, PluginController, BACKEND_CONTROLLER_NAME,
    ENGINE_CONTROLLER_NAME,
};
pub use policy_watcher::{MetricsController, METRICS_CONTROLLER_NAME};
pub use scale::{
    calculate_target, is_cooling_down, ScaleManager, ScaleRequest, SCALE_MANAGER_NAME,
};
