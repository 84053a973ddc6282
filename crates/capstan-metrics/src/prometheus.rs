//! Prometheus metrics backend.
//!
//! Node-level metrics are served by one node-exporter per node; the backend
//! discovers the exporter instance for each selected node through the
//! Prometheus targets API and scopes every query to those instances. A
//! mismatch between exporter count and node count means the topology is in
//! flux and the sample is rejected rather than silently skewed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use capstan_api::Node;
use capstan_cluster::Store;

use crate::error::MetricsError;
use crate::{
    is_valid_range, Backend, METRIC_CPU_PERCENT_UTILIZATION, METRIC_CUSTOM,
    METRIC_MEMORY_PERCENT_UTILIZATION,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Job name under which node exporters register as scrape targets.
const NODE_EXPORTER_JOB: &str = "node-exporter";

const VALID_AGGREGATIONS: [&str; 11] = [
    "sum",
    "min",
    "max",
    "avg",
    "stddev",
    "stdvar",
    "count",
    "count_values",
    "bottomk",
    "topk",
    "quantile",
];

// The cpu metric was renamed in node exporter 0.16.0; default to the older
// name until all fleets are past it.
const VALID_CPU_METRIC_NAMES: [&str; 2] = ["node_cpu_seconds_total", "node_cpu"];
const DEFAULT_CPU_METRIC_NAME: &str = "node_cpu";

const DEFAULT_AGGREGATION: &str = "avg";
const DEFAULT_RANGE: &str = "1m";

/// A metrics backend querying a Prometheus server.
pub struct PrometheusBackend {
    address: String,
    http: reqwest::Client,
    nodes: Arc<Store<Node>>,
}

impl std::fmt::Debug for PrometheusBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusBackend")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Recognized metric configuration keys, defaulted and validated before any
/// query is built. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueryConfig {
    aggregation: String,
    range: String,
    #[serde(rename = "cpuMetricName")]
    cpu_metric_name: String,
    /// Exporter instance regex; filled in by the backend, never by users.
    #[serde(skip)]
    instances: String,
}

impl QueryConfig {
    fn parse(configuration: &BTreeMap<String, String>) -> Result<Self, MetricsError> {
        let value = serde_json::to_value(configuration).map_err(|err| {
            MetricsError::InvalidConfiguration {
                reason: err.to_string(),
            }
        })?;
        let mut config: Self =
            serde_json::from_value(value).map_err(|err| MetricsError::InvalidConfiguration {
                reason: err.to_string(),
            })?;

        if config.aggregation.is_empty() {
            config.aggregation = DEFAULT_AGGREGATION.to_string();
        }
        if !VALID_AGGREGATIONS.contains(&config.aggregation.as_str()) {
            return Err(MetricsError::InvalidConfiguration {
                reason: format!("invalid aggregation {}", config.aggregation),
            });
        }

        if config.range.is_empty() {
            config.range = DEFAULT_RANGE.to_string();
        }
        if !is_valid_range(&config.range) {
            return Err(MetricsError::InvalidConfiguration {
                reason: format!("invalid range {}", config.range),
            });
        }

        if config.cpu_metric_name.is_empty() {
            config.cpu_metric_name = DEFAULT_CPU_METRIC_NAME.to_string();
        }
        if !VALID_CPU_METRIC_NAMES.contains(&config.cpu_metric_name.as_str()) {
            return Err(MetricsError::InvalidConfiguration {
                reason: format!("invalid node cpu metric name {}", config.cpu_metric_name),
            });
        }

        Ok(config)
    }
}

fn cpu_query(config: &QueryConfig) -> String {
    format!(
        "100 - ({agg}(irate({metric}{{mode='idle',instance=~'{instances}'}}[{range}])) * 100)",
        agg = config.aggregation,
        metric = config.cpu_metric_name,
        instances = config.instances,
        range = config.range,
    )
}

fn memory_query(config: &QueryConfig) -> String {
    format!(
        "100 * {agg}(1 - (avg_over_time(node_memory_MemAvailable{{instance=~'{instances}'}}[{range}]) \
         / avg_over_time(node_memory_MemTotal{{instance=~'{instances}'}}[{range}])))",
        agg = config.aggregation,
        instances = config.instances,
        range = config.range,
    )
}

/// Expands the placeholders `{{aggregation}}`, `{{range}}` and
/// `{{instances}}` in a user-provided query.
fn custom_query(
    configuration: &BTreeMap<String, String>,
    config: &QueryConfig,
) -> Result<String, MetricsError> {
    let template =
        configuration
            .get("query")
            .ok_or_else(|| MetricsError::InvalidConfiguration {
                reason: "configuration key \"query\" must be provided for a custom query".into(),
            })?;

    Ok(template
        .replace("{{aggregation}}", &config.aggregation)
        .replace("{{range}}", &config.range)
        .replace("{{instances}}", &config.instances))
}

fn instances_regex(instances: &[String]) -> String {
    instances
        .iter()
        .map(|instance| regex::escape(instance))
        .collect::<Vec<_>>()
        .join("|")
}

#[derive(Debug, Deserialize)]
struct TargetsResponse {
    status: String,
    #[serde(default)]
    data: Option<TargetsData>,
}

#[derive(Debug, Deserialize)]
struct TargetsData {
    #[serde(rename = "activeTargets", default)]
    active_targets: Vec<ActiveTarget>,
}

#[derive(Debug, Deserialize)]
struct ActiveTarget {
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    value: (f64, String),
}

/// Extracts the single scalar a policy query must produce.
fn scalar_from_response(response: QueryResponse) -> Result<f64, MetricsError> {
    if response.status != "success" {
        return Err(MetricsError::MalformedResponse {
            reason: response
                .error
                .unwrap_or_else(|| format!("query status {}", response.status)),
        });
    }

    let data = response
        .data
        .ok_or_else(|| MetricsError::MalformedResponse {
            reason: "response carries no data".into(),
        })?;

    if data.result_type != "vector" {
        return Err(MetricsError::MalformedResponse {
            reason: format!("unexpected result type {:?}", data.result_type),
        });
    }

    if data.result.len() != 1 {
        return Err(MetricsError::MalformedResponse {
            reason: format!(
                "expected vector to have a single element but it has {}",
                data.result.len()
            ),
        });
    }

    data.result[0]
        .value
        .1
        .parse()
        .map_err(|_| MetricsError::MalformedResponse {
            reason: format!("sample {:?} is not a float", data.result[0].value.1),
        })
}

impl PrometheusBackend {
    /// Creates a backend for the Prometheus server at `address`.
    ///
    /// # Errors
    ///
    /// [`MetricsError::InvalidConfiguration`] for an empty address.
    pub fn new(address: &str, nodes: Arc<Store<Node>>) -> Result<Self, MetricsError> {
        if address.is_empty() {
            return Err(MetricsError::InvalidConfiguration {
                reason: "address must not be empty".into(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            address: address.trim_end_matches('/').to_string(),
            http,
            nodes,
        })
    }

    /// Discovers the exporter instance address for each of `nodes` through
    /// the targets API.
    async fn exporter_instances(&self, nodes: &[Node]) -> Result<Vec<String>, MetricsError> {
        let url = format!("{}/api/v1/targets", self.address);
        let response: TargetsResponse = self.http.get(&url).send().await?.json().await?;

        if response.status != "success" {
            return Err(MetricsError::MalformedResponse {
                reason: "targets query did not succeed".into(),
            });
        }
        let targets = response
            .data
            .map(|data| data.active_targets)
            .unwrap_or_default();

        let mut instances = Vec::new();
        for target in &targets {
            if target.labels.get("job").map(String::as_str) != Some(NODE_EXPORTER_JOB) {
                continue;
            }
            let Some(node_name) = target.labels.get("node") else {
                continue;
            };
            if nodes.iter().any(|node| node.metadata.name == *node_name) {
                if let Some(instance) = target.labels.get("instance") {
                    instances.push(instance.clone());
                }
            }
        }

        if instances.len() != nodes.len() {
            return Err(MetricsError::InconsistentTopology {
                exporters: instances.len(),
                nodes: nodes.len(),
            });
        }

        Ok(instances)
    }

    async fn query(&self, query: &str) -> Result<f64, MetricsError> {
        debug!(query, "performing prometheus query");

        let url = format!("{}/api/v1/query", self.address);
        let response: QueryResponse = self
            .http
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await?
            .json()
            .await?;

        scalar_from_response(response)
    }
}

#[async_trait]
impl Backend for PrometheusBackend {
    async fn get_value(
        &self,
        metric: &str,
        configuration: &BTreeMap<String, String>,
        node_selector: &BTreeMap<String, String>,
    ) -> Result<f64, MetricsError> {
        let nodes = self.nodes.list_selected(node_selector);
        let instances = self.exporter_instances(&nodes).await?;

        let mut config = QueryConfig::parse(configuration)?;
        config.instances = instances_regex(&instances);

        match metric {
            METRIC_CPU_PERCENT_UTILIZATION => self.query(&cpu_query(&config)).await,
            METRIC_MEMORY_PERCENT_UTILIZATION => self.query(&memory_query(&config)).await,
            METRIC_CUSTOM => {
                let query = custom_query(configuration, &config)?;
                self.query(&query).await
            }
            other => Err(MetricsError::UnknownMetric {
                metric: other.to_string(),
            }),
        }
    }
}
