//! Message vocabulary exchanged between agents

use serde::Serialize;

use super::types::{AgentId, EdgeId, VehicleId};

/// Messages of the coordination protocol
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Message {
    /// A vehicle asks to enter `edge` through the light at its start node
    PassageRequest {
        vehicle_id: VehicleId,
        edge: EdgeId,
        priority: bool,
    },
    PassageGrant {
        vehicle_id: VehicleId,
        edge: EdgeId,
    },
    /// Not now; ask again after `retry_after` seconds
    PassageDeny {
        vehicle_id: VehicleId,
        edge: EdgeId,
        retry_after: f64,
    },
    /// The vehicle cleared the intersection or gave up its request
    PassageRelease {
        vehicle_id: VehicleId,
        edge: EdgeId,
    },
    IncidentReport {
        edge: EdgeId,
        severity: f64,
        ttl: f64,
    },
    CongestionReport {
        edge: EdgeId,
        observed_density: f64,
    },
}

impl Message {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::PassageRequest { .. } => "passage_request",
            Message::PassageGrant { .. } => "passage_grant",
            Message::PassageDeny { .. } => "passage_deny",
            Message::PassageRelease { .. } => "passage_release",
            Message::IncidentReport { .. } => "incident_report",
            Message::CongestionReport { .. } => "congestion_report",
        }
    }
}

/// An addressed message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub from: AgentId,
    pub to: AgentId,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: AgentId, to: AgentId, message: Message) -> Self {
        Self { from, to, message }
    }
}
