//! Core types for the traffic simulation
//!
//! Identifiers and small value types shared by the graph, the trackers and
//! the agents.

use serde::Serialize;
use std::fmt;

/// A grid coordinate identifying a node of the city graph.
///
/// Ordering is lexicographic on `(x, y)`, which the router relies on for
/// deterministic tie-breaking between equal-cost paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId {
    pub x: u32,
    pub y: u32,
}

impl NodeId {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Manhattan distance between two grid nodes
    pub fn manhattan(&self, other: &NodeId) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// What kind of place a node is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeKind {
    Intersection,
    Building,
    /// Valid destination for emergency vehicles
    Hospital,
}

/// A wrapper type for road segment IDs
///
/// Edge ids are dense (`0..edge_count`) because the topology never changes
/// after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EdgeId(pub usize);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// A wrapper type for incident IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IncidentId(pub u64);

/// A wrapper type for vehicle IDs
///
/// Vehicle ids are strings so that arbitration ties can be broken by
/// lexicographic order, e.g. `"vehicle01" < "vehicle02"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VehicleId(pub String);

impl VehicleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a message endpoint on the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AgentId {
    Vehicle(VehicleId),
    TrafficLight(NodeId),
    IncidentReporter,
    /// The endpoint through which incidents reach the event manager
    IncidentDesk,
}

impl AgentId {
    pub fn vehicle(id: &VehicleId) -> Self {
        AgentId::Vehicle(id.clone())
    }

    pub fn is_vehicle(&self) -> bool {
        matches!(self, AgentId::Vehicle(_))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentId::Vehicle(id) => write!(f, "{id}"),
            AgentId::TrafficLight(node) => write!(f, "light_{}_{}", node.x, node.y),
            AgentId::IncidentReporter => f.write_str("reporter"),
            AgentId::IncidentDesk => f.write_str("incident_desk"),
        }
    }
}

/// Simulation time in seconds since the simulation started
pub type SimTime = f64;

/// Severity given to roadblocks spawned by the reporter
pub const ROADBLOCK_SEVERITY: f64 = 10.0;

/// Minimum severity for an edge to count as blocked
pub const BLOCKED_THRESHOLD: f64 = 3.0;

/// Headroom that keeps the congestion factor finite at full capacity
pub const SATURATION_MARGIN: f64 = 0.05;

/// Minimum Manhattan distance of a roaming vehicle's next destination
pub const MIN_TRIP_DISTANCE: u32 = 8;
