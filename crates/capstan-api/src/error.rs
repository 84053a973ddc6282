//! Error types for the resource model.

use thiserror::Error;

/// An unrecognized comparison operator symbol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid comparison operator {symbol:?}")]
pub struct InvalidOperator {
    /// The symbol that failed to parse.
    pub symbol: String,
}

/// A declarative resource failed validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The min/max node bounds are inverted.
    #[error("minNodes {min} exceeds maxNodes {max}")]
    InvalidBounds {
        /// Configured lower bound.
        min: u32,
        /// Configured upper bound.
        max: u32,
    },

    /// A scaling policy configures neither side.
    #[error("scaling policy must configure at least one of scaleUp or scaleDown")]
    MissingPolicySide,

    /// A poll interval or sample period of zero seconds.
    #[error("{field} must be a positive number of seconds")]
    NonPositiveInterval {
        /// The offending field name.
        field: &'static str,
    },

    /// A policy side names an operator that does not parse.
    #[error(transparent)]
    InvalidOperator(#[from] InvalidOperator),
}
