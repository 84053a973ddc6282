//! Reconcilers that keep the plugin registries in sync with their
//! declarative resources.
//!
//! Add and update both land on the same path: delete any existing registry
//! entry, instantiate a fresh plugin from the spec, insert it. Deleting the
//! stale entry first means a live caller observing "disappeared" backs off
//! naturally until the replacement shows up.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use capstan_api::{AutoscalingEngine, MetricsBackend as MetricsBackendResource, Node, Pod, Resource};
use capstan_cluster::{Registry, Store, WatchEvent, WorkQueue};
use capstan_engines::{instantiate_engine, Engine};
use capstan_metrics::{instantiate_backend, Backend};

use crate::error::ControllerError;
use crate::reconcile::Reconciler;

/// Component name of the engine reconciler.
pub const ENGINE_CONTROLLER_NAME: &str = "AutoscalingEngineController";
/// Component name of the backend reconciler.
pub const BACKEND_CONTROLLER_NAME: &str = "MetricsBackendController";

const MAX_REQUEUES: u32 = 10;

type PluginFactory<R, T> = Box<dyn Fn(&R) -> Result<Arc<T>, String> + Send + Sync>;

/// Reconciles one plugin resource kind into one registry.
pub struct PluginController<R: Resource, T: ?Sized + Send + Sync + 'static> {
    controller_name: &'static str,
    store: Arc<Store<R>>,
    registry: Arc<Registry<T>>,
    queue: Arc<WorkQueue>,
    factory: PluginFactory<R, T>,
}

/// The engine reconciler: `AutoscalingEngine` resources → engine registry.
#[must_use]
pub fn engine_controller(
    store: Arc<Store<AutoscalingEngine>>,
    registry: Arc<Registry<dyn Engine>>,
    nodes: Arc<Store<Node>>,
) -> Arc<PluginController<AutoscalingEngine, dyn Engine>> {
    PluginController::new(
        ENGINE_CONTROLLER_NAME,
        store,
        registry,
        Box::new(move |resource| {
            instantiate_engine(resource, Arc::clone(&nodes)).map_err(|err| err.to_string())
        }),
    )
}

/// The backend reconciler: `MetricsBackend` resources → backend registry.
#[must_use]
pub fn backend_controller(
    store: Arc<Store<MetricsBackendResource>>,
    registry: Arc<Registry<dyn Backend>>,
    nodes: Arc<Store<Node>>,
    pods: Arc<Store<Pod>>,
) -> Arc<PluginController<MetricsBackendResource, dyn Backend>> {
    PluginController::new(
        BACKEND_CONTROLLER_NAME,
        store,
        registry,
        Box::new(move |resource| {
            instantiate_backend(resource, Arc::clone(&nodes), Arc::clone(&pods))
                .map_err(|err| err.to_string())
        }),
    )
}

impl<R: Resource, T: ?Sized + Send + Sync + 'static> PluginController<R, T> {
    fn new(
        controller_name: &'static str,
        store: Arc<Store<R>>,
        registry: Arc<Registry<T>>,
        factory: PluginFactory<R, T>,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller_name,
            store,
            registry,
            queue: WorkQueue::new(),
            factory,
        })
    }

    /// Runs the reconciler until the shutdown token fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut events = self.store.subscribe();

        info!(controller = self.controller_name, "starting controller");

        for resource in self.store.list() {
            self.queue.add(resource.name());
        }

        let watcher = {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            this.queue.shut_down();
                            return;
                        }
                        event = events.recv() => match event {
                            Ok(event) => {
                                let name = match &event {
                                    WatchEvent::Added(resource)
                                    | WatchEvent::Deleted(resource) => resource.name(),
                                    WatchEvent::Modified { new, .. } => new.name(),
                                };
                                this.queue.add(name);
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(
                                    controller = this.controller_name,
                                    missed,
                                    "lagged behind watch"
                                );
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                this.queue.shut_down();
                                return;
                            }
                        },
                    }
                }
            })
        };

        self.worker().await;
        let _ = watcher.await;
        info!(controller = self.controller_name, "shut down");
    }
}

#[async_trait]
impl<R: Resource, T: ?Sized + Send + Sync + 'static> Reconciler for PluginController<R, T> {
    fn name(&self) -> &'static str {
        self.controller_name
    }

    fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    fn max_requeues(&self) -> u32 {
        MAX_REQUEUES
    }

    async fn sync(&self, key: &str) -> Result<(), ControllerError> {
        let Some(resource) = self.store.get(key) else {
            // Resource is gone; drop its registry entry. Entries are plain
            // values, nothing to tear down beyond the mapping.
            self.registry.delete(key);
            return Ok(());
        };

        if self.registry.contains(key) {
            info!(
                controller = self.controller_name,
                name = %key,
                "entry already exists and will be replaced"
            );
            self.registry.delete(key);
        }

        info!(controller = self.controller_name, name = %key, "instantiating plugin");
        let entry = (self.factory)(&resource).map_err(|reason| {
            ControllerError::PluginInstantiation {
                kind: R::KIND,
                name: key.to_string(),
                reason,
            }
        })?;

        self.registry.put(key, entry);
        info!(controller = self.controller_name, name = %key, "instantiated successfully");
        Ok(())
    }
}
