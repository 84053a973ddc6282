//! InfluxDB metrics backend.
//!
//! Queries a telegraf-style schema over the InfluxDB 1.x HTTP query API.
//! Nodes are matched into queries by hostname, taken from the hostname
//! label on each selected node.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use capstan_api::{Node, HOSTNAME_LABEL};
use capstan_cluster::Store;

use crate::error::MetricsError;
use crate::{
    is_valid_range, Backend, METRIC_CPU_PERCENT_UTILIZATION, METRIC_CUSTOM,
    METRIC_MEMORY_PERCENT_UTILIZATION,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const VALID_AGGREGATIONS: [&str; 11] = [
    "count",
    "distinct",
    "integral",
    "mean",
    "median",
    "mode",
    "spread",
    "stdev",
    "sum",
    "max",
    "min",
];

const DEFAULT_AGGREGATION: &str = "mean";
const DEFAULT_DATABASE: &str = "telegraf";
const DEFAULT_RANGE: &str = "1m";
const DEFAULT_RETENTION_POLICY: &str = "rp_90d";

/// A metrics backend querying an InfluxDB server.
pub struct InfluxDbBackend {
    address: String,
    http: reqwest::Client,
    nodes: Arc<Store<Node>>,
}

impl std::fmt::Debug for InfluxDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxDbBackend")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Recognized metric configuration keys. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueryConfig {
    aggregation: String,
    database: String,
    range: String,
    #[serde(rename = "retentionPolicy")]
    retention_policy: String,
    /// Hostname filter clause; filled in by the backend, never by users.
    #[serde(skip)]
    hosts: String,
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

        if config.database.is_empty() {
            config.database = DEFAULT_DATABASE.to_string();
        }

        if config.range.is_empty() {
            config.range = DEFAULT_RANGE.to_string();
        }
        if !is_valid_range(&config.range) {
            return Err(MetricsError::InvalidConfiguration {
                reason: format!("invalid range {}", config.range),
            });
        }

        if config.retention_policy.is_empty() {
            config.retention_policy = DEFAULT_RETENTION_POLICY.to_string();
        }

        Ok(config)
    }
}

/// Builds the hostname filter clause. An empty host set matches all nodes.
fn host_filter(hostnames: &[String]) -> String {
    if hostnames.is_empty() {
        return "(true)".to_string();
    }

    let clauses: Vec<String> = hostnames
        .iter()
        .map(|host| format!("\"host\"='{host}'"))
        .collect();
    format!("({})", clauses.join(" OR "))
}

fn cpu_query(config: &QueryConfig) -> String {
    format!(
        "SELECT {agg}(\"usage_idle\") AS \"agg_usage_idle\" \
         FROM \"{db}\".\"{rp}\".\"cpu\" WHERE time > now() - {range} AND {hosts}",
        agg = config.aggregation,
        db = config.database,
        rp = config.retention_policy,
        range = config.range,
        hosts = config.hosts,
    )
}

fn memory_query(config: &QueryConfig) -> String {
    format!(
        "SELECT {agg}(\"used_percent\") AS \"agg_used_percent\" \
         FROM \"{db}\".\"{rp}\".\"mem\" WHERE time > now() - {range} AND {hosts}",
        agg = config.aggregation,
        db = config.database,
        rp = config.retention_policy,
        range = config.range,
        hosts = config.hosts,
    )
}

/// Expands the placeholders `{{aggregation}}`, `{{database}}`, `{{range}}`,
/// `{{retentionPolicy}}` and `{{hosts}}` in a user-provided query.
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
        .replace("{{database}}", &config.database)
        .replace("{{range}}", &config.range)
        .replace("{{retentionPolicy}}", &config.retention_policy)
        .replace("{{hosts}}", &config.hosts))
}

#[derive(Debug, Deserialize)]
struct InfluxResponse {
    #[serde(default)]
    results: Vec<InfluxResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfluxResult {
    #[serde(default)]
    series: Vec<InfluxSeries>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfluxSeries {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Extracts the single scalar a policy query must produce.
fn scalar_from_response(response: InfluxResponse) -> Result<f64, MetricsError> {
    if let Some(error) = response.error {
        return Err(MetricsError::MalformedResponse { reason: error });
    }

    if response.results.len() != 1 {
        return Err(MetricsError::MalformedResponse {
            reason: format!("unexpected number of results: {}", response.results.len()),
        });
    }

    let result = &response.results[0];
    if let Some(error) = &result.error {
        return Err(MetricsError::MalformedResponse {
            reason: error.clone(),
        });
    }

    if result.series.len() != 1 {
        return Err(MetricsError::MalformedResponse {
            reason: format!("expected a single series but found {}", result.series.len()),
        });
    }

    let values = &result.series[0].values;
    if values.len() != 1 {
        return Err(MetricsError::MalformedResponse {
            reason: format!(
                "expected series to have a single value element but it has {}",
                values.len()
            ),
        });
    }

    values[0]
        .get(1)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| MetricsError::MalformedResponse {
            reason: "series value is not a float".into(),
        })
}

impl InfluxDbBackend {
    /// Creates a backend for the InfluxDB server at `address`.
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

    async fn query(&self, database: &str, query: &str) -> Result<f64, MetricsError> {
        debug!(query, "performing influxdb query");

        let url = format!("{}/query", self.address);
        let response: InfluxResponse = self
            .http
            .get(&url)
            .query(&[("db", database), ("q", query)])
            .send()
            .await?
            .json()
            .await?;

        scalar_from_response(response)
    }
}

#[async_trait]
impl Backend for InfluxDbBackend {
    async fn get_value(
        &self,
        metric: &str,
        configuration: &BTreeMap<String, String>,
        node_selector: &BTreeMap<String, String>,
    ) -> Result<f64, MetricsError> {
        let nodes = self.nodes.list_selected(node_selector);
        let hostnames: Vec<String> = nodes
            .iter()
            .filter_map(|node| node.metadata.labels.get(HOSTNAME_LABEL).cloned())
            .collect();

        let mut config = QueryConfig::parse(configuration)?;
        config.hosts = host_filter(&hostnames);

        let query = match metric {
            METRIC_CPU_PERCENT_UTILIZATION => cpu_query(&config),
            METRIC_MEMORY_PERCENT_UTILIZATION => memory_query(&config),
            METRIC_CUSTOM => custom_query(configuration, &config)?,
            other => {
                return Err(MetricsError::UnknownMetric {
                    metric: other.to_string(),
                })
            }
        };

        self.query(&config.database, &query).await
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

    mod config {
        use super::*;

        #[test]
        fn empty_configuration_gets_defaults() {
            let config = QueryConfig::parse(&config_map(&[])).expect("parse");
            assert_eq!(config.aggregation, "mean");
            assert_eq!(config.database, "telegraf");
            assert_eq!(config.range, "1m");
            assert_eq!(config.retention_policy, "rp_90d");
        }

        #[test]
        fn recognized_keys_are_honored() {
            let config = QueryConfig::parse(&config_map(&[
                ("aggregation", "median"),
                ("database", "machines"),
                ("range", "10m"),
                ("retentionPolicy", "rp_7d"),
            ]))
            .expect("parse");
            assert_eq!(config.aggregation, "median");
            assert_eq!(config.database, "machines");
            assert_eq!(config.range, "10m");
            assert_eq!(config.retention_policy, "rp_7d");
        }

        #[test]
        fn invalid_values_are_rejected() {
            assert!(QueryConfig::parse(&config_map(&[("aggregation", "avg")])).is_err());
            assert!(QueryConfig::parse(&config_map(&[("range", "soon")])).is_err());
        }
    }

    mod queries {
        use super::*;

        fn test_config() -> QueryConfig {
            let mut config = QueryConfig::parse(&config_map(&[])).expect("parse");
            config.hosts = host_filter(&["n1".to_string(), "n2".to_string()]);
            config
        }

        #[test]
        fn host_filter_joins_with_or() {
            assert_eq!(
                host_filter(&["a".to_string(), "b".to_string()]),
                "(\"host\"='a' OR \"host\"='b')"
            );
        }

        #[test]
        fn empty_host_set_matches_everything() {
            assert_eq!(host_filter(&[]), "(true)");
        }

        #[test]
        fn cpu_query_shape() {
            let query = cpu_query(&test_config());
            assert_eq!(
                query,
                "SELECT mean(\"usage_idle\") AS \"agg_usage_idle\" \
                 FROM \"telegraf\".\"rp_90d\".\"cpu\" \
                 WHERE time > now() - 1m AND (\"host\"='n1' OR \"host\"='n2')"
            );
        }

        #[test]
        fn memory_query_uses_mem_measurement() {
            let query = memory_query(&test_config());
            assert!(query.contains("\"used_percent\""));
            assert!(query.contains("\"mem\""));
        }

        #[test]
        fn custom_query_expands_placeholders() {
            let configuration = config_map(&[(
                "query",
                "SELECT {{aggregation}}(\"load5\") FROM \"{{database}}\".\"{{retentionPolicy}}\".\"system\" \
                 WHERE time > now() - {{range}} AND {{hosts}}",
            )]);
            let query = custom_query(&configuration, &test_config()).expect("expand");
            assert_eq!(
                query,
                "SELECT mean(\"load5\") FROM \"telegraf\".\"rp_90d\".\"system\" \
                 WHERE time > now() - 1m AND (\"host\"='n1' OR \"host\"='n2')"
            );
        }
    }

    mod responses {
        use super::*;

        fn parse(json: &str) -> InfluxResponse {
            serde_json::from_str(json).expect("valid test json")
        }

        #[test]
        fn single_value_series_is_accepted() {
            let response = parse(
                r#"{"results":[{"series":[{"name":"cpu",
                    "values":[["2024-01-01T00:00:00Z",63.25]]}]}]}"#,
            );
            let value = scalar_from_response(response).expect("scalar");
            assert!((value - 63.25).abs() < f64::EPSILON);
        }

        #[test]
        fn multiple_values_are_rejected() {
            let response = parse(
                r#"{"results":[{"series":[{"values":[["t",1.0],["t",2.0]]}]}]}"#,
            );
            let err = scalar_from_response(response).unwrap_err();
            assert!(err.to_string().contains("single value element"));
        }

        #[test]
        fn missing_series_is_rejected() {
            let response = parse(r#"{"results":[{}]}"#);
            assert!(scalar_from_response(response).is_err());
        }

        #[test]
        fn server_error_is_surfaced() {
            let response = parse(r#"{"error":"database not found"}"#);
            let err = scalar_from_response(response).unwrap_err();
            assert!(err.to_string().contains("database not found"));
        }

        #[test]
        fn non_numeric_value_is_rejected() {
            let response =
                parse(r#"{"results":[{"series":[{"values":[["t","high"]]}]}]}"#);
            assert!(scalar_from_response(response).is_err());
        }
    }

    #[test]
    fn empty_address_is_rejected() {
        let nodes = Arc::new(Store::new());
        assert!(InfluxDbBackend::new("", nodes).is_err());
    }
}
