//! Cluster allocation metrics backend.
//!
//! Computes allocation percentages straight from the cluster state caches:
//! `100 * sum(requests) / sum(allocatable)` over the selected nodes and the
//! non-terminal pods scheduled onto them. Quantities are fixed-point
//! milli-units held in i64; the sums overflow only past ~9.2e18 milli-units
//! of a single resource.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use capstan_api::{Node, Pod, GPU_VENDOR_RESOURCES};
use capstan_cluster::Store;

use crate::error::MetricsError;
use crate::Backend;

/// Metric name for CPU allocation, as a percentage.
pub const METRIC_CPU_PERCENT_ALLOCATION: &str = "cpu_percent_allocation";
/// Metric name for GPU allocation, as a percentage.
pub const METRIC_GPU_PERCENT_ALLOCATION: &str = "gpu_percent_allocation";
/// Metric name for memory allocation, as a percentage.
pub const METRIC_MEMORY_PERCENT_ALLOCATION: &str = "memory_percent_allocation";
/// Metric name for ephemeral storage allocation, as a percentage.
pub const METRIC_EPHEMERAL_STORAGE_PERCENT_ALLOCATION: &str =
    "ephemeral_storage_percent_allocation";
/// Metric name for pod slot allocation, as a percentage.
pub const METRIC_POD_PERCENT_ALLOCATION: &str = "pod_percent_allocation";

/// A metrics backend computing allocation percentages from cluster state.
pub struct AllocationBackend {
    nodes: Arc<Store<Node>>,
    pods: Arc<Store<Pod>>,
}

impl std::fmt::Debug for AllocationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationBackend").finish_non_exhaustive()
    }
}

impl AllocationBackend {
    /// Creates a backend over the given node and pod caches.
    #[must_use]
    pub fn new(nodes: Arc<Store<Node>>, pods: Arc<Store<Pod>>) -> Self {
        Self { nodes, pods }
    }

    /// Pods scheduled onto one of `nodes` that still count toward
    /// allocation.
    fn allocated_pods_on(&self, nodes: &[Node]) -> Vec<Pod> {
        self.pods
            .list()
            .into_iter()
            .filter(|pod| {
                !pod.phase.is_terminal()
                    && nodes.iter().any(|node| node.metadata.name == pod.node_name)
            })
            .collect()
    }
}

fn percentage(requested: i64, allocatable: i64) -> f64 {
    100.0 * (requested as f64 / allocatable as f64)
}

fn cpu_allocation(pods: &[Pod], nodes: &[Node]) -> f64 {
    let allocatable: i64 = nodes.iter().map(|n| n.allocatable.cpu_millis).sum();
    let requested: i64 = pods
        .iter()
        .flat_map(|p| &p.containers)
        .map(|c| c.requests.cpu_millis)
        .sum();
    percentage(requested, allocatable)
}

fn memory_allocation(pods: &[Pod], nodes: &[Node]) -> f64 {
    let allocatable: i64 = nodes.iter().map(|n| n.allocatable.memory_millis).sum();
    let requested: i64 = pods
        .iter()
        .flat_map(|p| &p.containers)
        .map(|c| c.requests.memory_millis)
        .sum();
    percentage(requested, allocatable)
}

fn ephemeral_storage_allocation(pods: &[Pod], nodes: &[Node]) -> f64 {
    let allocatable: i64 = nodes
        .iter()
        .map(|n| n.allocatable.ephemeral_storage_millis)
        .sum();
    let requested: i64 = pods
        .iter()
        .flat_map(|p| &p.containers)
        .map(|c| c.requests.ephemeral_storage_millis)
        .sum();
    percentage(requested, allocatable)
}

fn gpu_allocation(pods: &[Pod], nodes: &[Node]) -> f64 {
    let mut allocatable: i64 = 0;
    for node in nodes {
        for vendor in GPU_VENDOR_RESOURCES {
            allocatable += node.allocatable.gpus.get(vendor).copied().unwrap_or(0);
        }
    }

    let mut requested: i64 = 0;
    for container in pods.iter().flat_map(|p| &p.containers) {
        for vendor in GPU_VENDOR_RESOURCES {
            requested += container.requests.gpus.get(vendor).copied().unwrap_or(0);
        }
    }

    percentage(requested, allocatable)
}

fn pod_allocation(pods: &[Pod], nodes: &[Node]) -> f64 {
    let allocatable: i64 = nodes.iter().map(|n| n.allocatable.pods).sum();
    percentage(pods.len() as i64, allocatable)
}

#[async_trait]
impl Backend for AllocationBackend {
    async fn get_value(
        &self,
        metric: &str,
        _configuration: &BTreeMap<String, String>,
        node_selector: &BTreeMap<String, String>,
    ) -> Result<f64, MetricsError> {
        let nodes = self.nodes.list_selected(node_selector);
        let pods = self.allocated_pods_on(&nodes);

        debug!(
            metric,
            pods = pods.len(),
            nodes = nodes.len(),
            "performing allocation calculation"
        );

        match metric {
            METRIC_CPU_PERCENT_ALLOCATION => Ok(cpu_allocation(&pods, &nodes)),
            METRIC_GPU_PERCENT_ALLOCATION => Ok(gpu_allocation(&pods, &nodes)),
            METRIC_MEMORY_PERCENT_ALLOCATION => Ok(memory_allocation(&pods, &nodes)),
            METRIC_EPHEMERAL_STORAGE_PERCENT_ALLOCATION => {
                Ok(ephemeral_storage_allocation(&pods, &nodes))
            }
            METRIC_POD_PERCENT_ALLOCATION => Ok(pod_allocation(&pods, &nodes)),
            other => Err(MetricsError::UnknownMetric {
                metric: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use capstan_api::{ContainerSpec, ObjectMeta, PodPhase, ResourceCapacity};

    fn node(name: &str, cpu_millis: i64, pods: i64) -> Node {
        Node {
            metadata: ObjectMeta::named(name).with_label("pool", "a"),
            allocatable: ResourceCapacity {
                cpu_millis,
                memory_millis: 8_000_000,
                ephemeral_storage_millis: 100_000_000,
                pods,
                gpus: BTreeMap::from([("nvidia.com/gpu".to_string(), 2000)]),
            },
            ..Default::default()
        }
    }

    fn pod(name: &str, node_name: &str, cpu_millis: i64, phase: PodPhase) -> Pod {
        Pod {
            metadata: ObjectMeta::named(name),
            node_name: node_name.into(),
            phase,
            containers: vec![ContainerSpec {
                requests: ResourceCapacity {
                    cpu_millis,
                    memory_millis: 2_000_000,
                    gpus: BTreeMap::from([("nvidia.com/gpu".to_string(), 1000)]),
                    ..Default::default()
                },
            }],
        }
    }

    fn backend_with(nodes: Vec<Node>, pods: Vec<Pod>) -> AllocationBackend {
        let node_store = Arc::new(Store::new());
        for n in nodes {
            node_store.apply(n);
        }
        let pod_store = Arc::new(Store::new());
        for p in pods {
            pod_store.apply(p);
        }
        AllocationBackend::new(node_store, pod_store)
    }

    fn selector() -> BTreeMap<String, String> {
        BTreeMap::from([("pool".to_string(), "a".to_string())])
    }

    #[tokio::test]
    async fn cpu_allocation_percentage() {
        let backend = backend_with(
            vec![node("n1", 4000, 110), node("n2", 4000, 110)],
            vec![
                pod("p1", "n1", 2000, PodPhase::Running),
                pod("p2", "n2", 2000, PodPhase::Running),
            ],
        );

        let value = backend
            .get_value(METRIC_CPU_PERCENT_ALLOCATION, &BTreeMap::new(), &selector())
            .await
            .expect("value");
        assert!((value - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn terminal_pods_are_excluded() {
        let backend = backend_with(
            vec![node("n1", 4000, 110)],
            vec![
                pod("p1", "n1", 2000, PodPhase::Running),
                pod("p2", "n1", 2000, PodPhase::Succeeded),
                pod("p3", "n1", 2000, PodPhase::Failed),
            ],
        );

        let value = backend
            .get_value(METRIC_CPU_PERCENT_ALLOCATION, &BTreeMap::new(), &selector())
            .await
            .expect("value");
        assert!((value - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn pods_on_unselected_nodes_are_excluded() {
        let mut other = node("n9", 4000, 110);
        other.metadata.labels.insert("pool".into(), "b".into());

        let backend = backend_with(
            vec![node("n1", 4000, 110), other],
            vec![
                pod("p1", "n1", 1000, PodPhase::Running),
                pod("p2", "n9", 4000, PodPhase::Running),
            ],
        );

        let value = backend
            .get_value(METRIC_CPU_PERCENT_ALLOCATION, &BTreeMap::new(), &selector())
            .await
            .expect("value");
        assert!((value - 25.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn gpu_allocation_sums_vendor_resources() {
        let backend = backend_with(
            vec![node("n1", 4000, 110)],
            vec![pod("p1", "n1", 1000, PodPhase::Running)],
        );

        let value = backend
            .get_value(METRIC_GPU_PERCENT_ALLOCATION, &BTreeMap::new(), &selector())
            .await
            .expect("value");
        // 1000 of 2000 GPU milli-units requested.
        assert!((value - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn pod_allocation_counts_pods() {
        let backend = backend_with(
            vec![node("n1", 4000, 10)],
            vec![
                pod("p1", "n1", 100, PodPhase::Running),
                pod("p2", "n1", 100, PodPhase::Pending),
            ],
        );

        let value = backend
            .get_value(METRIC_POD_PERCENT_ALLOCATION, &BTreeMap::new(), &selector())
            .await
            .expect("value");
        assert!((value - 20.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unknown_metric_is_rejected() {
        let backend = backend_with(vec![], vec![]);
        let err = backend
            .get_value("disk_percent_allocation", &BTreeMap::new(), &selector())
            .await
            .unwrap_err();
        assert!(matches!(err, MetricsError::UnknownMetric { .. }));
    }
}
