//! Point-in-time views of the city for reporting and the terminal map

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;

use super::city::City;
use super::events::Incident;
use super::types::{EdgeId, NodeId, NodeKind, SimTime, VehicleId};
use super::vehicle::{VehicleRole, VehicleStatus};

/// Where a vehicle currently is
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AgentPosition {
    pub node: NodeId,
    pub edge: Option<EdgeId>,
    pub status: VehicleStatus,
    pub role: VehicleRole,
}

/// Latest published position of every vehicle
#[derive(Debug, Default)]
pub struct PositionBoard {
    positions: RwLock<BTreeMap<VehicleId, AgentPosition>>,
}

impl PositionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, vehicle: VehicleId, position: AgentPosition) {
        self.positions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(vehicle, position);
    }

    pub fn remove(&self, vehicle: &VehicleId) {
        self.positions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(vehicle);
    }

    pub fn get(&self, vehicle: &VehicleId) -> Option<AgentPosition> {
        self.positions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(vehicle)
            .copied()
    }

    pub fn all(&self) -> BTreeMap<VehicleId, AgentPosition> {
        self.positions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub kind: NodeKind,
    pub traffic_light: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeSnapshot {
    pub id: EdgeId,
    pub a: NodeId,
    pub b: NodeId,
    pub capacity: u32,
    pub count: usize,
    pub density: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VehicleSnapshot {
    pub id: VehicleId,
    #[serde(flatten)]
    pub position: AgentPosition,
}

/// Everything observable about the city at one instant
#[derive(Debug, Clone, Serialize)]
pub struct CitySnapshot {
    pub time: SimTime,
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
    pub incidents: Vec<Incident>,
    pub vehicles: Vec<VehicleSnapshot>,
    pub average_density: f64,
}

impl CitySnapshot {
    pub fn capture(city: &City, board: &PositionBoard) -> Self {
        let nodes = city
            .graph
            .nodes()
            .map(|node| NodeSnapshot {
                id: node.id,
                kind: node.kind,
                traffic_light: city.graph.has_traffic_light(node.id),
            })
            .collect();
        let edges = city
            .graph
            .edges()
            .map(|road| EdgeSnapshot {
                id: road.id,
                a: road.a,
                b: road.b,
                capacity: road.capacity,
                count: city.occupancy.count(road.id),
                density: city.occupancy.density(road.id),
                cost: city.current_cost(road.id),
            })
            .collect();
        let vehicles = board
            .all()
            .into_iter()
            .map(|(id, position)| VehicleSnapshot { id, position })
            .collect();

        Self {
            time: city.events.now(),
            nodes,
            edges,
            incidents: city.events.all_active(),
            vehicles,
            average_density: city.average_density(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Terminal map of the grid.
///
/// Nodes sit on even columns and rows with their roads between them.
/// Roads show `=` when congested and `#` when blocked by an incident.
pub fn render_map(city: &City, board: &PositionBoard, congestion_threshold: f64) -> String {
    let (max_x, max_y) = city
        .graph
        .nodes()
        .fold((0, 0), |(mx, my), n| (mx.max(n.id.x), my.max(n.id.y)));
    let width = max_x as usize * 2 + 1;
    let height = max_y as usize * 2 + 1;
    let mut grid = vec![vec![' '; width]; height];

    for road in city.graph.edges() {
        let col = (road.a.x + road.b.x) as usize;
        let row = (road.a.y + road.b.y) as usize;
        grid[row][col] = if city.events.is_blocked(road.id) {
            '#'
        } else if city.occupancy.density(road.id) >= congestion_threshold {
            '='
        } else if road.a.y == road.b.y {
            '-'
        } else {
            '|'
        };
    }

    for node in city.graph.nodes() {
        let (col, row) = (node.id.x as usize * 2, node.id.y as usize * 2);
        grid[row][col] = match node.kind {
            NodeKind::Hospital => 'H',
            NodeKind::Building => 'B',
            NodeKind::Intersection if city.graph.has_traffic_light(node.id) => 'L',
            NodeKind::Intersection => '+',
        };
    }

    for position in board.all().values() {
        let (col, row) = match position.edge {
            Some(edge) => {
                let road = city.graph.road(edge);
                ((road.a.x + road.b.x) as usize, (road.a.y + road.b.y) as usize)
            }
            None => (position.node.x as usize * 2, position.node.y as usize * 2),
        };
        if row < height && col < width {
            grid[row][col] = match position.role {
                VehicleRole::Emergency => 'E',
                VehicleRole::Normal => 'C',
            };
        }
    }

    let mut out = String::new();
    out.push_str("Legend: L=Light, H=Hospital, +=Intersection, C=Car, E=Emergency, ");
    out.push_str("#=Blocked, ==Congested\n");
    for row in &grid {
        out.extend(row.iter());
        out.push('\n');
    }
    out
}
