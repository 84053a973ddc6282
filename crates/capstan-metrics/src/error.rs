//! Error types for metrics backends.

use thiserror::Error;

/// Errors surfaced by metrics backends.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The backend does not expose the requested metric.
    #[error("unknown metric {metric:?}")]
    UnknownMetric {
        /// The requested metric name.
        metric: String,
    },

    /// No backend implementation exists for the declared type.
    #[error("unknown backend type {kind:?}")]
    UnknownBackendType {
        /// The declared type string.
        kind: String,
    },

    /// The metric configuration failed validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// What was wrong.
        reason: String,
    },

    /// The backend answered, but not with a usable scalar.
    #[error("malformed response: {reason}")]
    MalformedResponse {
        /// What was wrong with the response.
        reason: String,
    },

    /// The discovered exporter topology does not match the node set.
    #[error("found {exporters} exporter targets for {nodes} nodes")]
    InconsistentTopology {
        /// Exporter targets discovered.
        exporters: usize,
        /// Nodes selected.
        nodes: usize,
    },

    /// The query could not be delivered.
    #[error("querying backend")]
    Transport {
        /// Underlying HTTP error.
        #[from]
        source: reqwest::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = MetricsError::UnknownMetric {
            metric: "disk_iops".into(),
        };
        assert_eq!(err.to_string(), "unknown metric \"disk_iops\"");

        let err = MetricsError::InconsistentTopology {
            exporters: 2,
            nodes: 3,
        };
        assert_eq!(err.to_string(), "found 2 exporter targets for 3 nodes");
    }
}
