//! Vultr autoscaling engine.
//!
//! Same group-by-ID shape as the Linode engine against the VKE API, with
//! the API key read from an environment variable named in configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use capstan_api::Node;
use capstan_cluster::Store;

use crate::error::EngineError;
use crate::{check, pool_id_from_nodes, token_from_env, Engine, STRATEGY_RANDOM};

const DEFAULT_BASE_URL: &str = "https://api.vultr.com/v2";

/// Default node label carrying the VKE pool ID.
pub const DEFAULT_POOL_ID_LABEL: &str = "vke.vultr.com/node-pool-id";

/// Configuration key for the VKE cluster ID.
pub const CONFIG_KEY_CLUSTER_ID: &str = "clusterID";
/// Configuration key naming the env var that holds the API key.
pub const CONFIG_KEY_API_KEY_ENV_VAR_NAME: &str = "apiKeyEnvVarName";
/// Configuration key overriding the pool ID node label.
pub const CONFIG_KEY_POOL_ID_LABEL_KEY: &str = "poolIDLabelKey";

/// An engine scaling Vultr Kubernetes Engine node pools.
pub struct VultrEngine {
    name: String,
    config: CloudConfig,
    api_key: String,
    http: reqwest::Client,
    base_url: String,
    nodes: Arc<Store<Node>>,
}

impl std::fmt::Debug for VultrEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VultrEngine")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CloudConfig {
    #[serde(rename = "clusterID")]
    cluster_id: String,
    #[serde(rename = "poolIDLabelKey")]
    pool_id_label_key: String,
}

impl CloudConfig {
    fn parse(configuration: &BTreeMap<String, String>) -> Result<Self, EngineError> {
        let value = serde_json::to_value(configuration).map_err(|err| {
            EngineError::InvalidConfiguration {
                reason: err.to_string(),
            }
        })?;
        let mut config: Self =
            serde_json::from_value(value).map_err(|err| EngineError::InvalidConfiguration {
                reason: err.to_string(),
            })?;

        if config.cluster_id.is_empty() {
            return Err(EngineError::InvalidConfiguration {
                reason: format!("{CONFIG_KEY_CLUSTER_ID} must be provided"),
            });
        }
        if config.pool_id_label_key.is_empty() {
            config.pool_id_label_key = DEFAULT_POOL_ID_LABEL.to_string();
        }

        Ok(config)
    }
}

#[derive(Debug, Serialize)]
struct PoolPatch {
    node_quantity: u32,
}

impl VultrEngine {
    /// Creates an engine from its declarative configuration.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfiguration`] when the cluster ID is missing
    /// or the API key env var is unset.
    pub fn new(
        name: &str,
        configuration: &BTreeMap<String, String>,
        nodes: Arc<Store<Node>>,
    ) -> Result<Self, EngineError> {
        if name.is_empty() {
            return Err(EngineError::InvalidConfiguration {
                reason: "name must be provided".into(),
            });
        }

        let config = CloudConfig::parse(configuration)?;
        let api_key = token_from_env(configuration, CONFIG_KEY_API_KEY_ENV_VAR_NAME)?;

        Ok(Self {
            name: name.to_string(),
            config,
            api_key,
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            nodes,
        })
    }

    async fn resize_pool(&self, pool_id: &str, count: u32) -> Result<(), EngineError> {
        let url = format!(
            "{}/kubernetes/clusters/{}/node-pools/{}",
            self.base_url, self.config.cluster_id, pool_id
        );
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.api_key)
            .json(&PoolPatch {
                node_quantity: count,
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Engine for VultrEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_target_node_count(
        &self,
        node_selector: &BTreeMap<String, String>,
        desired: u32,
        strategy: &str,
    ) -> Result<bool, EngineError> {
        match strategy {
            "" | STRATEGY_RANDOM => {}
            other => {
                return Err(EngineError::UnknownStrategy {
                    strategy: other.to_string(),
                })
            }
        }

        let nodes = self.nodes.list_selected(node_selector);
        if nodes.len() as u32 == desired {
            return Ok(false);
        }

        let Some(pool_id) = pool_id_from_nodes(&nodes, &self.config.pool_id_label_key)? else {
            info!(engine = %self.name, "selector matches no nodes, nothing to scale");
            return Ok(false);
        };

        info!(
            engine = %self.name,
            pool = %pool_id,
            desired,
            "requesting vultr node pool resize"
        );
        self.resize_pool(&pool_id, desired).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn api_key_env_var_is_mandatory() {
        let configuration = config_map(&[("clusterID", "vke-1")]);
        assert!(VultrEngine::new("vke", &configuration, Arc::new(Store::new())).is_err());
    }

    #[test]
    fn constructs_with_valid_configuration() {
        std::env::set_var("CAPSTAN_VULTR_TEST_KEY", "k3y");
        let configuration = config_map(&[
            ("clusterID", "vke-1"),
            ("apiKeyEnvVarName", "CAPSTAN_VULTR_TEST_KEY"),
        ]);
        let engine = VultrEngine::new("vke", &configuration, Arc::new(Store::new()))
            .expect("engine");
        assert_eq!(engine.name(), "vke");
        assert_eq!(engine.config.pool_id_label_key, DEFAULT_POOL_ID_LABEL);
    }

    #[tokio::test]
    async fn unknown_strategy_is_rejected() {
        std::env::set_var("CAPSTAN_VULTR_TEST_KEY", "k3y");
        let configuration = config_map(&[
            ("clusterID", "vke-1"),
            ("apiKeyEnvVarName", "CAPSTAN_VULTR_TEST_KEY"),
        ]);
        let engine = VultrEngine::new("vke", &configuration, Arc::new(Store::new()))
            .expect("engine");

        let err = engine
            .set_target_node_count(&BTreeMap::new(), 2, "spread")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownStrategy { .. }));
    }
}
