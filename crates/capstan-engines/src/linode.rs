//! Linode autoscaling engine.
//!
//! LKE nodes carry their pool ID as a node label, so the engine reads the
//! pool off a randomly selected node of the group and issues a single pool
//! resize call.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use capstan_api::Node;
use capstan_cluster::Store;

use crate::error::EngineError;
use crate::{check, pool_id_from_nodes, token_from_env, Engine, STRATEGY_RANDOM};

const DEFAULT_BASE_URL: &str = "https://api.linode.com/v4";

/// Default node label carrying the LKE pool ID.
pub const DEFAULT_POOL_ID_LABEL: &str = "lke.linode.com/pool-id";

/// Configuration key for the LKE cluster ID.
pub const CONFIG_KEY_CLUSTER_ID: &str = "clusterID";
/// Configuration key naming the env var that holds the API token.
pub const CONFIG_KEY_TOKEN_ENV_VAR_NAME: &str = "tokenEnvVarName";
/// Configuration key overriding the pool ID node label.
pub const CONFIG_KEY_POOL_ID_LABEL_KEY: &str = "poolIDLabelKey";

/// An engine scaling Linode Kubernetes Engine node pools.
pub struct LinodeEngine {
    name: String,
    config: CloudConfig,
    token: String,
    http: reqwest::Client,
    base_url: String,
    nodes: Arc<Store<Node>>,
}

impl std::fmt::Debug for LinodeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinodeEngine")
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
struct PoolResize {
    count: u32,
}

impl LinodeEngine {
    /// Creates an engine from its declarative configuration.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfiguration`] when the cluster ID is missing
    /// or the token env var is unset.
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
        let token = token_from_env(configuration, CONFIG_KEY_TOKEN_ENV_VAR_NAME)?;

        Ok(Self {
            name: name.to_string(),
            config,
            token,
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            nodes,
        })
    }

    async fn resize_pool(&self, pool_id: &str, count: u32) -> Result<(), EngineError> {
        let url = format!(
            "{}/lke/clusters/{}/pools/{}",
            self.base_url, self.config.cluster_id, pool_id
        );
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .json(&PoolResize { count })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Engine for LinodeEngine {
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
            "requesting linode pool resize"
        );
        self.resize_pool(&pool_id, desired).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use capstan_api::ObjectMeta;

    fn config_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn engine() -> LinodeEngine {
        std::env::set_var("CAPSTAN_LINODE_TEST_TOKEN", "t0ken");
        let configuration = config_map(&[
            ("clusterID", "12345"),
            ("tokenEnvVarName", "CAPSTAN_LINODE_TEST_TOKEN"),
        ]);
        LinodeEngine::new("lke", &configuration, Arc::new(Store::new())).expect("engine")
    }

    #[test]
    fn pool_label_defaults() {
        let engine = engine();
        assert_eq!(engine.config.pool_id_label_key, DEFAULT_POOL_ID_LABEL);
    }

    #[test]
    fn cluster_id_is_mandatory() {
        std::env::set_var("CAPSTAN_LINODE_TEST_TOKEN", "t0ken");
        let configuration =
            config_map(&[("tokenEnvVarName", "CAPSTAN_LINODE_TEST_TOKEN")]);
        assert!(LinodeEngine::new("lke", &configuration, Arc::new(Store::new())).is_err());
    }

    #[tokio::test]
    async fn zero_matching_nodes_is_a_noop() {
        let engine = engine();
        let scaled = engine
            .set_target_node_count(&BTreeMap::new(), 3, "")
            .await
            .expect("noop");
        assert!(!scaled);
    }

    #[tokio::test]
    async fn matching_current_count_is_a_noop() {
        std::env::set_var("CAPSTAN_LINODE_TEST_TOKEN", "t0ken");
        let nodes = Arc::new(Store::new());
        nodes.apply(Node {
            metadata: ObjectMeta::named("n1")
                .with_label("pool", "a")
                .with_label(DEFAULT_POOL_ID_LABEL, "p-1"),
            ..Default::default()
        });

        let configuration = config_map(&[
            ("clusterID", "12345"),
            ("tokenEnvVarName", "CAPSTAN_LINODE_TEST_TOKEN"),
        ]);
        let engine = LinodeEngine::new("lke", &configuration, nodes).expect("engine");

        let selector = BTreeMap::from([("pool".to_string(), "a".to_string())]);
        let scaled = engine
            .set_target_node_count(&selector, 1, "random")
            .await
            .expect("noop");
        assert!(!scaled);
    }

    #[tokio::test]
    async fn unknown_strategy_is_rejected() {
        let engine = engine();
        let err = engine
            .set_target_node_count(&BTreeMap::new(), 3, "oldest-first")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownStrategy { .. }));
    }
}
