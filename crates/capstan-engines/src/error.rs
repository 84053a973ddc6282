//! Error types for autoscaling engines.

use thiserror::Error;

/// Errors surfaced by autoscaling engines.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No engine implementation exists for the declared type.
    #[error("unknown engine type {kind:?}")]
    UnknownEngineType {
        /// The declared type string.
        kind: String,
    },

    /// The engine configuration failed validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// What was wrong.
        reason: String,
    },

    /// The engine does not implement the requested strategy.
    #[error("unknown scale strategy {strategy:?}")]
    UnknownStrategy {
        /// The requested strategy.
        strategy: String,
    },

    /// A selected node does not carry the pool identification label.
    #[error("node {node:?} does not carry label {label:?}")]
    MissingPoolLabel {
        /// The node that was selected.
        node: String,
        /// The label that was expected.
        label: String,
    },

    /// The provider rejected a call.
    #[error("provider returned status {status}: {message}")]
    Provider {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The requested node count cannot be reached.
    #[error("cannot drain to {desired} nodes across {pools} pools with a one-node floor")]
    DrainExhausted {
        /// The requested total node count.
        desired: u32,
        /// Number of pools available to drain.
        pools: usize,
    },

    /// The provider call could not be delivered.
    #[error("calling provider")]
    Transport {
        /// Underlying HTTP error.
        #[from]
        source: reqwest::Error,
    },
}
