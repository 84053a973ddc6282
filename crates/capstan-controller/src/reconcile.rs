//! Shared worker loop for the workqueue-driven controllers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use capstan_cluster::WorkQueue;

use crate::error::ControllerError;

/// A controller that processes keys off a rate-limited workqueue.
#[async_trait]
pub(crate) trait Reconciler: Send + Sync {
    /// Controller name for logs.
    fn name(&self) -> &'static str;

    /// The controller's queue.
    fn queue(&self) -> &Arc<WorkQueue>;

    /// How many rate-limited retries a key gets before it is dropped.
    fn max_requeues(&self) -> u32;

    /// Reconciles one key against the observed state.
    async fn sync(&self, key: &str) -> Result<(), ControllerError>;

    /// Processes keys until the queue shuts down, requeueing failures with
    /// backoff up to the retry cap.
    async fn worker(&self) {
        while let Some(key) = self.queue().get().await {
            match self.sync(&key).await {
                Ok(()) => self.queue().forget(&key),
                Err(err) => {
                    let requeues = self.queue().num_requeues(&key);
                    if requeues < self.max_requeues() {
                        warn!(
                            controller = self.name(),
                            key = %key,
                            error = %err,
                            requeues,
                            "sync failed, requeueing"
                        );
                        self.queue().add_rate_limited(&key);
                    } else {
                        error!(
                            controller = self.name(),
                            key = %key,
                            error = %err,
                            "sync failed too often, dropping out of the queue"
                        );
                        self.queue().forget(&key);
                    }
                }
            }
            self.queue().done(&key);
        }
    }
}
