//! DigitalOcean autoscaling engine.
//!
//! DigitalOcean node pools carry no label we could use to tell which pool a
//! selected node belongs to. When the group's node selector carries the
//! configured pool label, exactly that pool is scaled; otherwise the engine
//! falls back to the whole cluster: scale up adds the difference to one
//! random pool, scale down shuffles the pools and drains them in order,
//! each to a floor of one node, spreading the reduction across pools.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::{check, token_from_env, Engine, STRATEGY_RANDOM};

const DEFAULT_BASE_URL: &str = "https://api.digitalocean.com/v2";

/// Configuration key for the DigitalOcean cluster ID.
pub const CONFIG_KEY_CLUSTER_ID: &str = "clusterID";
/// Configuration key naming the env var that holds the API token.
pub const CONFIG_KEY_TOKEN_ENV_VAR_NAME: &str = "tokenEnvVarName";
/// Configuration key for the selector label that carries a pool ID.
pub const CONFIG_KEY_NODE_POOL_LABEL_KEY: &str = "nodePoolLabelKey";

/// An engine scaling DigitalOcean Kubernetes node pools.
pub struct DigitalOceanEngine {
    name: String,
    config: CloudConfig,
    token: String,
    http: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for DigitalOceanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalOceanEngine")
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
    #[serde(rename = "nodePoolLabelKey")]
    node_pool_label_key: String,
}

impl CloudConfig {
    fn parse(configuration: &BTreeMap<String, String>) -> Result<Self, EngineError> {
        let value = serde_json::to_value(configuration).map_err(|err| {
            EngineError::InvalidConfiguration {
                reason: err.to_string(),
            }
        })?;
        let config: Self =
            serde_json::from_value(value).map_err(|err| EngineError::InvalidConfiguration {
                reason: err.to_string(),
            })?;

        if config.cluster_id.is_empty() {
            return Err(EngineError::InvalidConfiguration {
                reason: format!("{CONFIG_KEY_CLUSTER_ID} must be provided"),
            });
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NodePool {
    id: String,
    name: String,
    count: u32,
}

#[derive(Debug, Deserialize)]
struct PoolList {
    node_pools: Vec<NodePool>,
}

#[derive(Debug, Deserialize)]
struct PoolItem {
    node_pool: NodePool,
}

#[derive(Debug, Serialize)]
struct PoolUpdate<'a> {
    name: &'a str,
    count: u32,
}

/// Plans a scale down of `reduce` nodes across `pools`, draining pools in
/// the order given and leaving at least one node in each.
fn plan_drain(
    pools: &[NodePool],
    mut reduce: u32,
    desired: u32,
) -> Result<Vec<(NodePool, u32)>, EngineError> {
    let mut plan = Vec::new();

    for pool in pools {
        if reduce == 0 {
            break;
        }
        if pool.count <= 1 {
            continue;
        }

        let new_count = if pool.count > reduce {
            pool.count - reduce
        } else {
            1
        };
        reduce -= pool.count - new_count;
        plan.push((pool.clone(), new_count));
    }

    // Left over when the desired total is smaller than the number of pools.
    if reduce != 0 {
        return Err(EngineError::DrainExhausted {
            desired,
            pools: pools.len(),
        });
    }

    Ok(plan)
}

impl DigitalOceanEngine {
    /// Creates an engine from its declarative configuration.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfiguration`] when the cluster ID is missing
    /// or the token env var is unset.
    pub fn new(name: &str, configuration: &BTreeMap<String, String>) -> Result<Self, EngineError> {
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
        })
    }

    fn pools_url(&self) -> String {
        format!(
            "{}/kubernetes/clusters/{}/node_pools",
            self.base_url, self.config.cluster_id
        )
    }

    async fn list_pools(&self) -> Result<Vec<NodePool>, EngineError> {
        let response = self
            .http
            .get(self.pools_url())
            .bearer_auth(&self.token)
            .send()
            .await?;
        let list: PoolList = check(response).await?.json().await?;
        Ok(list.node_pools)
    }

    async fn get_pool(&self, pool_id: &str) -> Result<NodePool, EngineError> {
        let response = self
            .http
            .get(format!("{}/{}", self.pools_url(), pool_id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let item: PoolItem = check(response).await?.json().await?;
        Ok(item.node_pool)
    }

    async fn set_pool_count(&self, pool: &NodePool, count: u32) -> Result<(), EngineError> {
        debug!(pool = %pool.id, count, "resizing digitalocean node pool");

        let response = self
            .http
            .put(format!("{}/{}", self.pools_url(), pool.id))
            .bearer_auth(&self.token)
            .json(&PoolUpdate {
                name: &pool.name,
                count,
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Scales exactly the pool named by the selector's pool label.
    async fn scale_labeled_pool(&self, pool_id: &str, desired: u32) -> Result<bool, EngineError> {
        let pool = self.get_pool(pool_id).await?;
        if pool.count == desired {
            return Ok(false);
        }

        self.set_pool_count(&pool, desired).await?;
        Ok(true)
    }

    /// Scales the cluster as a whole when no pool label is available.
    async fn scale_any_pool(&self, desired: u32) -> Result<bool, EngineError> {
        let mut pools = self.list_pools().await?;
        if pools.is_empty() {
            return Ok(false);
        }

        let total: u32 = pools.iter().map(|pool| pool.count).sum();
        if total == desired {
            return Ok(false);
        }

        if total < desired {
            let grow_by = desired - total;
            let pool = &pools[rand::thread_rng().gen_range(0..pools.len())];
            self.set_pool_count(pool, pool.count + grow_by).await?;
        } else {
            pools.shuffle(&mut rand::thread_rng());
            for (pool, new_count) in plan_drain(&pools, total - desired, desired)? {
                self.set_pool_count(&pool, new_count).await?;
            }
        }

        Ok(true)
    }
}

#[async_trait]
impl Engine for DigitalOceanEngine {
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

        info!(
            engine = %self.name,
            desired,
            "requesting digitalocean node count"
        );

        let labeled_pool = (!self.config.node_pool_label_key.is_empty())
            .then(|| node_selector.get(&self.config.node_pool_label_key))
            .flatten();

        match labeled_pool {
            Some(pool_id) => self.scale_labeled_pool(pool_id, desired).await,
            None => self.scale_any_pool(desired).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(id: &str, count: u32) -> NodePool {
        NodePool {
            id: id.into(),
            name: format!("pool-{id}"),
            count,
        }
    }

    fn config_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    mod configuration {
        use super::*;

        #[test]
        fn cluster_id_is_mandatory() {
            let err = CloudConfig::parse(&config_map(&[])).unwrap_err();
            assert!(err.to_string().contains("clusterID"));
        }

        #[test]
        fn engine_requires_token_env_var() {
            let configuration = config_map(&[
                ("clusterID", "c-123"),
                ("tokenEnvVarName", "CAPSTAN_DO_TEST_UNSET"),
            ]);
            assert!(DigitalOceanEngine::new("do", &configuration).is_err());
        }

        #[test]
        fn engine_constructs_with_valid_configuration() {
            std::env::set_var("CAPSTAN_DO_TEST_TOKEN", "t0ken");
            let configuration = config_map(&[
                ("clusterID", "c-123"),
                ("tokenEnvVarName", "CAPSTAN_DO_TEST_TOKEN"),
                ("nodePoolLabelKey", "doks.digitalocean.com/node-pool-id"),
            ]);
            let engine = DigitalOceanEngine::new("do", &configuration).expect("engine");
            assert_eq!(engine.name(), "do");
            assert_eq!(engine.config.cluster_id, "c-123");
        }
    }

    mod strategy {
        use super::*;

        #[tokio::test]
        async fn unknown_strategy_is_rejected() {
            std::env::set_var("CAPSTAN_DO_TEST_TOKEN2", "t0ken");
            let configuration = config_map(&[
                ("clusterID", "c-123"),
                ("tokenEnvVarName", "CAPSTAN_DO_TEST_TOKEN2"),
            ]);
            let engine = DigitalOceanEngine::new("do", &configuration).expect("engine");

            let err = engine
                .set_target_node_count(&BTreeMap::new(), 3, "cheapest")
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::UnknownStrategy { .. }));
        }
    }

    mod drain {
        use super::*;

        #[test]
        fn single_pool_takes_the_whole_reduction() {
            let pools = vec![pool("a", 5)];
            let plan = plan_drain(&pools, 2, 3).expect("plan");
            assert_eq!(plan.len(), 1);
            assert_eq!(plan[0].1, 3);
        }

        #[test]
        fn reduction_spreads_across_pools_with_floor_of_one() {
            let pools = vec![pool("a", 3), pool("b", 3)];
            // Reduce by 4: pool a drains to 1 (takes 2), pool b drains to 1.
            let plan = plan_drain(&pools, 4, 2).expect("plan");
            assert_eq!(plan.len(), 2);
            assert_eq!(plan[0].1, 1);
            assert_eq!(plan[1].1, 1);
        }

        #[test]
        fn one_node_pools_are_skipped() {
            let pools = vec![pool("a", 1), pool("b", 4)];
            let plan = plan_drain(&pools, 2, 3).expect("plan");
            assert_eq!(plan.len(), 1);
            assert_eq!(plan[0].0.id, "b");
            assert_eq!(plan[0].1, 2);
        }

        #[test]
        fn stops_once_the_reduction_is_satisfied() {
            let pools = vec![pool("a", 4), pool("b", 4)];
            let plan = plan_drain(&pools, 2, 6).expect("plan");
            assert_eq!(plan.len(), 1);
            assert_eq!(plan[0].1, 2);
        }

        #[test]
        fn impossible_reduction_is_an_error() {
            // Two pools cannot drop below two nodes total.
            let pools = vec![pool("a", 2), pool("b", 2)];
            let err = plan_drain(&pools, 3, 1).unwrap_err();
            assert!(matches!(err, EngineError::DrainExhausted { desired: 1, .. }));
        }
    }
}
