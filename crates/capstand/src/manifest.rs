//! Declarative state loading and resync.
//!
//! The state directory holds one JSON array per resource kind. The resync
//! task re-reads the directory and diffs it into the stores; the resulting
//! watch events are what drive the controllers. Missing files mean "no
//! resources of that kind".

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use capstan_api::{
    AutoscalingEngine, AutoscalingGroup, AutoscalingPolicy, MetricsBackend, Node, Pod, Resource,
};
use capstan_cluster::Store;

const GROUPS_FILE: &str = "groups.json";
const POLICIES_FILE: &str = "policies.json";
const ENGINES_FILE: &str = "engines.json";
const BACKENDS_FILE: &str = "backends.json";
const NODES_FILE: &str = "nodes.json";
const PODS_FILE: &str = "pods.json";

/// The stores the manifest loader feeds.
#[derive(Clone)]
pub struct Stores {
    pub groups: Arc<Store<AutoscalingGroup>>,
    pub policies: Arc<Store<AutoscalingPolicy>>,
    pub engines: Arc<Store<AutoscalingEngine>>,
    pub backends: Arc<Store<MetricsBackend>>,
    pub nodes: Arc<Store<Node>>,
    pub pods: Arc<Store<Pod>>,
}

/// One full read of the state directory.
pub struct Manifest {
    groups: Vec<AutoscalingGroup>,
    policies: Vec<AutoscalingPolicy>,
    engines: Vec<AutoscalingEngine>,
    backends: Vec<MetricsBackend>,
    nodes: Vec<Node>,
    pods: Vec<Pod>,
}

impl Manifest {
    /// Reads every resource file in `dir`. Resources that fail validation
    /// are dropped with an error log; the operator has to fix the manifest.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        anyhow::ensure!(
            dir.is_dir(),
            "state directory {} does not exist",
            dir.display()
        );

        let mut groups: Vec<AutoscalingGroup> = load_file(dir.join(GROUPS_FILE))?;
        groups.retain(|group| match group.validate() {
            Ok(()) => true,
            Err(err) => {
                error!(group = %group.metadata.name, error = %err, "dropping invalid group");
                false
            }
        });

        let mut policies: Vec<AutoscalingPolicy> = load_file(dir.join(POLICIES_FILE))?;
        policies.retain(|policy| match policy.validate() {
            Ok(()) => true,
            Err(err) => {
                error!(policy = %policy.metadata.name, error = %err, "dropping invalid policy");
                false
            }
        });

        Ok(Self {
            groups,
            policies,
            engines: load_file(dir.join(ENGINES_FILE))?,
            backends: load_file(dir.join(BACKENDS_FILE))?,
            nodes: load_file(dir.join(NODES_FILE))?,
            pods: load_file(dir.join(PODS_FILE))?,
        })
    }

    /// Diffs the manifest into the stores: everything present is applied,
    /// everything absent is deleted.
    pub fn sync(self, stores: &Stores) {
        sync_kind(self.groups, &stores.groups);
        sync_kind(self.policies, &stores.policies);
        sync_kind(self.engines, &stores.engines);
        sync_kind(self.backends, &stores.backends);
        sync_kind(self.nodes, &stores.nodes);
        sync_kind(self.pods, &stores.pods);
    }
}

fn load_file<T: DeserializeOwned>(path: PathBuf) -> anyhow::Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let data = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn sync_kind<T: Resource>(desired: Vec<T>, store: &Store<T>) {
    let mut stale: HashSet<String> = store
        .list()
        .into_iter()
        .map(|obj| obj.meta().name.clone())
        .collect();

    for obj in desired {
        stale.remove(obj.name());
        store.apply(obj);
    }

    for name in stale {
        store.delete(&name);
    }
}

/// Periodically re-reads the state directory until shutdown. Load failures
/// keep the previous state and retry on the next tick.
pub fn spawn_resync(
    dir: PathBuf,
    interval: Duration,
    stores: Stores,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The caller already did the initial load.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    match Manifest::load(&dir) {
                        Ok(manifest) => manifest.sync(&stores),
                        Err(err) => {
                            warn!(error = %err, "failed to reload state directory");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> Stores {
        Stores {
            groups: Arc::new(Store::new()),
            policies: Arc::new(Store::new()),
            engines: Arc::new(Store::new()),
            backends: Arc::new(Store::new()),
            nodes: Arc::new(Store::new()),
            pods: Arc::new(Store::new()),
        }
    }

    fn write(dir: &Path, file: &str, contents: &str) {
        fs::write(dir.join(file), contents).expect("write manifest file");
    }

    #[test]
    fn empty_directory_loads_empty_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manifest = Manifest::load(dir.path()).expect("load");

        let stores = stores();
        manifest.sync(&stores);
        assert!(stores.groups.is_empty());
        assert!(stores.nodes.is_empty());
    }

    #[test]
    fn resources_load_and_apply() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            dir.path(),
            GROUPS_FILE,
            r#"[{
                "metadata": {"name": "workers"},
                "spec": {
                    "nodeSelector": {"pool": "a"},
                    "engine": "do-nyc1",
                    "minNodes": 1,
                    "maxNodes": 5
                }
            }]"#,
        );
        write(
            dir.path(),
            NODES_FILE,
            r#"[{"metadata": {"name": "n1", "labels": {"pool": "a"}}}]"#,
        );

        let stores = stores();
        Manifest::load(dir.path()).expect("load").sync(&stores);

        let group = stores.groups.get("workers").expect("group");
        assert_eq!(group.spec.engine, "do-nyc1");
        assert_eq!(stores.nodes.len(), 1);
    }

    #[test]
    fn invalid_resources_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            dir.path(),
            GROUPS_FILE,
            r#"[{
                "metadata": {"name": "inverted"},
                "spec": {"engine": "e1", "minNodes": 5, "maxNodes": 2}
            }]"#,
        );

        let stores = stores();
        Manifest::load(dir.path()).expect("load").sync(&stores);
        assert!(stores.groups.is_empty());
    }

    #[test]
    fn malformed_json_is_a_load_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), GROUPS_FILE, "not json");
        assert!(Manifest::load(dir.path()).is_err());
    }

    #[test]
    fn missing_directory_is_a_load_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(Manifest::load(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn resync_deletes_absent_resources() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            dir.path(),
            NODES_FILE,
            r#"[{"metadata": {"name": "n1"}}, {"metadata": {"name": "n2"}}]"#,
        );

        let stores = stores();
        Manifest::load(dir.path()).expect("load").sync(&stores);
        assert_eq!(stores.nodes.len(), 2);

        write(dir.path(), NODES_FILE, r#"[{"metadata": {"name": "n2"}}]"#);
        Manifest::load(dir.path()).expect("load").sync(&stores);

        assert!(stores.nodes.get("n1").is_none());
        assert!(stores.nodes.get("n2").is_some());
    }

    #[test]
    fn reapplying_preserves_versions() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), NODES_FILE, r#"[{"metadata": {"name": "n1"}}]"#);

        let stores = stores();
        Manifest::load(dir.path()).expect("load").sync(&stores);
        Manifest::load(dir.path()).expect("load").sync(&stores);

        let node = stores.nodes.get("n1").expect("node");
        // Identical spec: generation stays put while the version moves.
        assert_eq!(node.metadata.generation, 1);
        assert_eq!(node.metadata.resource_version, 2);
    }
}
