//! Metrics backends for the capstan autoscaler.
//!
//! A backend answers exactly one question: the current scalar value of a
//! named metric for the nodes selected by a label selector. Pollers look
//! backends up in the process-wide registry by name on every tick, so a
//! backend replaced by its reconciler is picked up on the next sample.

#![forbid(unsafe_code)]

mod allocation;
mod error;
mod influxdb;
mod prometheus;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use capstan_api::{MetricsBackend as MetricsBackendResource, Node, Pod};
use capstan_cluster::Store;

pub use allocation::{
    AllocationBackend, METRIC_CPU_PERCENT_ALLOCATION,
    METRIC_EPHEMERAL_STORAGE_PERCENT_ALLOCATION, METRIC_GPU_PERCENT_ALLOCATION,
    METRIC_MEMORY_PERCENT_ALLOCATION, METRIC_POD_PERCENT_ALLOCATION,
};
pub use error::MetricsError;
pub use influxdb::InfluxDbBackend;
pub use prometheus::PrometheusBackend;

/// Metric name for CPU utilization, as a percentage.
pub const METRIC_CPU_PERCENT_UTILIZATION: &str = "cpu_percent_utilization";
/// Metric name for memory utilization, as a percentage.
pub const METRIC_MEMORY_PERCENT_UTILIZATION: &str = "memory_percent_utilization";
/// Metric name for a free-form templated query.
pub const METRIC_CUSTOM: &str = "custom";

/// Valid range durations, e.g. `30s`, `5m`, `1h`.
static RANGE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+[smhdwy]$").unwrap_or_else(|_| unreachable!()));

pub(crate) fn is_valid_range(range: &str) -> bool {
    RANGE_REGEX.is_match(range)
}

/// A source of scalar metric values.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Queries the backend and returns the raw numerical value of the
    /// requested metric, with the given configuration, for the nodes
    /// selected by `node_selector`, at this point in time.
    ///
    /// # Errors
    ///
    /// Transport failures, malformed responses, unknown metrics, invalid
    /// configuration, and non-scalar results all surface as
    /// [`MetricsError`].
    async fn get_value(
        &self,
        metric: &str,
        configuration: &BTreeMap<String, String>,
        node_selector: &BTreeMap<String, String>,
    ) -> Result<f64, MetricsError>;
}

/// Instantiates a backend from its declarative resource. This is the only
/// place that knows the backend type strings.
///
/// # Errors
///
/// [`MetricsError::UnknownBackendType`] for an unrecognized type and
/// [`MetricsError::InvalidConfiguration`] when mandatory keys are missing.
pub fn instantiate_backend(
    resource: &MetricsBackendResource,
    nodes: Arc<Store<Node>>,
    pods: Arc<Store<Pod>>,
) -> Result<Arc<dyn Backend>, MetricsError> {
    match resource.spec.kind.as_str() {
        "prometheus" => {
            let address = resource.spec.configuration.get("address").ok_or_else(|| {
                MetricsError::InvalidConfiguration {
                    reason: "prometheus backend requires address in configuration".into(),
                }
            })?;
            Ok(Arc::new(PrometheusBackend::new(address, nodes)?))
        }
        "influxdb" => {
            let address = resource.spec.configuration.get("address").ok_or_else(|| {
                MetricsError::InvalidConfiguration {
                    reason: "influxdb backend requires address in configuration".into(),
                }
            })?;
            Ok(Arc::new(InfluxDbBackend::new(address, nodes)?))
        }
        "cluster" => Ok(Arc::new(AllocationBackend::new(nodes, pods))),
        other => Err(MetricsError::UnknownBackendType {
            kind: other.to_string(),
        }),
    }
}
