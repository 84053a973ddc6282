//! Error types for the controllers.

use thiserror::Error;

use capstan_api::InvalidOperator;
use capstan_cluster::ClusterError;
use capstan_engines::EngineError;
use capstan_metrics::MetricsError;

/// The error delivered on a scale request's reply channel.
#[derive(Error, Debug)]
pub enum ScaleError {
    /// Engine lookup or status write against the cluster state failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The engine call failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors produced by reconcile sync handlers, pollers and poll managers.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// A poller could not find its policy's backend in the registry.
    #[error("metrics backend {backend:?} specified by policy {policy:?} is unavailable")]
    BackendUnavailable {
        /// Backend named by the policy.
        backend: String,
        /// Policy the poller samples for.
        policy: String,
        /// Registry lookup failure.
        #[source]
        source: ClusterError,
    },

    /// Sampling a metric failed.
    #[error("getting metric {metric:?} for policy {policy:?}")]
    MetricFetch {
        /// Metric the policy samples.
        metric: String,
        /// Policy the poller samples for.
        policy: String,
        /// Backend failure.
        #[source]
        source: MetricsError,
    },

    /// A policy side names an operator the poller cannot evaluate.
    #[error("policy {policy:?} carries an invalid operator")]
    InvalidPolicyOperator {
        /// The offending policy.
        policy: String,
        /// Parse failure.
        #[source]
        source: InvalidOperator,
    },

    /// The scale manager answered a request with an error.
    #[error("requesting scale for group {group:?}")]
    ScaleRequest {
        /// Group the request was for.
        group: String,
        /// The reply.
        #[source]
        source: ScaleError,
    },

    /// The scale manager is gone or dropped the request without a reply.
    #[error("scale manager dropped the request for group {group:?}")]
    ScaleManagerUnavailable {
        /// Group the request was for.
        group: String,
    },

    /// A plugin could not be instantiated from its resource.
    #[error("instantiating {kind} {name:?}: {reason}")]
    PluginInstantiation {
        /// Resource kind.
        kind: &'static str,
        /// Resource name.
        name: String,
        /// Underlying failure.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_error_wraps_sources() {
        let err = ScaleError::from(ClusterError::NotFound {
            kind: "engine",
            name: "e1".into(),
        });
        assert_eq!(err.to_string(), "engine \"e1\" does not exist");
    }

    #[test]
    fn controller_error_messages() {
        let err = ControllerError::ScaleManagerUnavailable {
            group: "workers".into(),
        };
        assert_eq!(
            err.to_string(),
            "scale manager dropped the request for group \"workers\""
        );
    }
}
