//! Scaling vocabulary shared by policies, requests and events.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Direction of a scaling operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    /// Add nodes to the group.
    Up,
    /// Remove nodes from the group.
    Down,
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// How a policy's adjustment value is applied to the current node count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentType {
    /// The adjustment value is a node count, truncated to an integer.
    Absolute,
    /// The adjustment value is a percentage of the current count; the
    /// resulting delta is rounded up so a nonzero percentage always moves
    /// the count by at least one.
    Percent,
}

impl fmt::Display for AdjustmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute => write!(f, "absolute"),
            Self::Percent => write!(f, "percent"),
        }
    }
}
