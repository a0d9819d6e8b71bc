//! Smart traffic simulation core
//!
//! A grid city whose edge costs react to incidents and congestion, vehicles
//! that route and reroute over it, and traffic lights that arbitrate
//! passage through their intersections. Agents only talk through the
//! transport; shared state lives in the [`City`].

mod agent;
mod city;
mod city_graph;
mod clock;
mod config;
mod error;
mod events;
mod metrics;
mod occupancy;
mod protocol;
mod reporter;
mod router;
mod snapshot;
mod traffic_light;
mod transport;
mod types;
mod vehicle;
mod world;

pub use agent::{run_agent, Agent, AgentContext, AgentRuntime, SimAgent};
pub use city::City;
pub use city_graph::{congestion_factor, CityGraph, CityGraphBuilder, Node, Road};
pub use clock::SimulationClock;
pub use config::SimConfig;
pub use error::SimError;
pub use events::{EventManager, Incident, IncidentState, SeverityPolicy};
pub use metrics::{drain_records, MetricKind, MetricRecord, MetricsSink, MetricsSummary};
pub use occupancy::{OccupancyRecord, OccupancyTracker};
pub use protocol::{Envelope, Message};
pub use reporter::IncidentReporterAgent;
pub use router::{Route, Router};
pub use snapshot::{
    render_map, AgentPosition, CitySnapshot, EdgeSnapshot, NodeSnapshot, PositionBoard,
    VehicleSnapshot,
};
pub use traffic_light::{
    Decision, Grant, LightState, PendingRequest, TrafficLight, TrafficLightAgent,
};
pub use transport::{ChannelTransport, Mailbox, Transport};
pub use types::{
    AgentId, EdgeId, IncidentId, NodeId, NodeKind, SimTime, VehicleId, BLOCKED_THRESHOLD,
    MIN_TRIP_DISTANCE, ROADBLOCK_SEVERITY, SATURATION_MARGIN,
};
pub use vehicle::{EmergencyVehicleAgent, VehicleAgent, VehicleRole, VehicleSettings, VehicleStatus};
pub use world::{SimWorld, SimulationReport, VehicleReport};
