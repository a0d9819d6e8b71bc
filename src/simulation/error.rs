//! Error taxonomy of the simulation core

use thiserror::Error;

use super::types::{EdgeId, NodeId};

/// Errors raised by the simulation core.
///
/// `Configuration` and `RoutingFailure` are fatal: they mean the topology is
/// broken. `ProtocolViolation` and `AnomalousOccupancy` are recovered where
/// they happen and only logged.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no route from {origin} to {destination}")]
    RoutingFailure { origin: NodeId, destination: NodeId },

    #[error("vehicle {vehicle} left edge {edge} without entering it")]
    AnomalousOccupancy { edge: EdgeId, vehicle: String },
}

impl SimError {
    /// Whether the error must stop the simulation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SimError::Configuration(_) | SimError::RoutingFailure { .. }
        )
    }
}
