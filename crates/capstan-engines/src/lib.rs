//! Cloud autoscaling engines for the capstan autoscaler.
//!
//! An engine is the actuator side of the system: given a node selector, a
//! desired node count and a strategy name, it makes the provider calls that
//! move the matching node group to that count. Which node leaves on scale
//! down is the provider's decision, not ours.
//!
//! Engines are instantiated by the engine reconciler from
//! `AutoscalingEngine` resources and looked up by name in the process-wide
//! registry at scale time.

#![forbid(unsafe_code)]

mod digitalocean;
mod error;
mod linode;
mod vultr;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use capstan_api::{AutoscalingEngine as AutoscalingEngineResource, Node};
use capstan_cluster::Store;

pub use digitalocean::DigitalOceanEngine;
pub use error::EngineError;
pub use linode::LinodeEngine;
pub use vultr::VultrEngine;

/// The strategy every engine currently defaults to when the group does not
/// name one.
pub const STRATEGY_RANDOM: &str = "random";

/// A cloud/infra actuator that can set a node group's target count.
#[async_trait]
pub trait Engine: Send + Sync + std::fmt::Debug {
    /// The engine's registered name.
    fn name(&self) -> &str;

    /// Drives the node group selected by `node_selector` toward `desired`
    /// nodes using the given strategy. An empty strategy selects the
    /// engine's default.
    ///
    /// Returns `Ok(false)` when the request was a valid no-op: the target
    /// already equals the current count, or the selector matches no nodes.
    /// The caller must not begin a cooldown in that case.
    ///
    /// # Errors
    ///
    /// Unknown strategies, configuration problems and provider failures all
    /// surface as [`EngineError`].
    async fn set_target_node_count(
        &self,
        node_selector: &BTreeMap<String, String>,
        desired: u32,
        strategy: &str,
    ) -> Result<bool, EngineError>;
}

/// Instantiates an engine from its declarative resource. This is the only
/// place that knows the engine type strings.
///
/// # Errors
///
/// [`EngineError::UnknownEngineType`] for an unrecognized type and
/// [`EngineError::InvalidConfiguration`] when mandatory keys are missing or
/// the named token environment variable is unset.
pub fn instantiate_engine(
    resource: &AutoscalingEngineResource,
    nodes: Arc<Store<Node>>,
) -> Result<Arc<dyn Engine>, EngineError> {
    let name = resource.metadata.name.as_str();
    let configuration = &resource.spec.configuration;

    match resource.spec.kind.as_str() {
        "digitalocean" => Ok(Arc::new(DigitalOceanEngine::new(name, configuration)?)),
        "linode" => Ok(Arc::new(LinodeEngine::new(name, configuration, nodes)?)),
        "vultr" => Ok(Arc::new(VultrEngine::new(name, configuration, nodes)?)),
        other => Err(EngineError::UnknownEngineType {
            kind: other.to_string(),
        }),
    }
}

/// Reads a bearer token from the environment variable named by
/// `configuration[key]`.
pub(crate) fn token_from_env(
    configuration: &BTreeMap<String, String>,
    key: &str,
) -> Result<String, EngineError> {
    let var = configuration
        .get(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::InvalidConfiguration {
            reason: format!("{key} must be provided"),
        })?;

    match std::env::var(var) {
        Ok(token) if !token.is_empty() => Ok(token),
        _ => Err(EngineError::InvalidConfiguration {
            reason: format!("{key} must reference an env var holding a token"),
        }),
    }
}

/// Maps a non-2xx provider response to [`EngineError::Provider`].
pub(crate) async fn check(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(EngineError::Provider {
        status: status.as_u16(),
        message,
    })
}

/// Reads the pool ID label off a randomly selected node. Returns `Ok(None)`
/// when the slice is empty.
pub(crate) fn pool_id_from_nodes(
    nodes: &[Node],
    label_key: &str,
) -> Result<Option<String>, EngineError> {
    if nodes.is_empty() {
        return Ok(None);
    }

    let node = &nodes[rand::thread_rng().gen_range(0..nodes.len())];
    match node.metadata.labels.get(label_key) {
        Some(id) => Ok(Some(id.clone())),
        None => Err(EngineError::MissingPoolLabel {
            node: node.metadata.name.clone(),
            label: label_key.to_string(),
        }),
    }
}
