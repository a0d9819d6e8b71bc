//! City road graph and dynamic edge costs
//!
//! The topology is fixed once built. Edge costs are never stored: they are
//! derived on every read from the incident registry and occupancy records.

use anyhow::{bail, Context, Result};
use petgraph::graph::{EdgeIndex, NodeIndex, UnGraph};
use std::collections::HashMap;

use super::config::SimConfig;
use super::error::SimError;
use super::events::{EventManager, SeverityPolicy};
use super::occupancy::OccupancyTracker;
use super::types::{EdgeId, NodeId, NodeKind, SimTime, SATURATION_MARGIN};

/// A node of the city graph
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
}

/// A road segment connecting two nodes in both directions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Road {
    pub id: EdgeId,
    pub a: NodeId,
    pub b: NodeId,
    pub base_weight: f64,
    pub capacity: u32,
}

impl Road {
    /// The endpoint across the road from `node`
    pub fn other_end(&self, node: NodeId) -> NodeId {
        if node == self.a {
            self.b
        } else {
            self.a
        }
    }

    pub fn touches(&self, node: NodeId) -> bool {
        self.a == node || self.b == node
    }
}

/// Congestion multiplier for a density given as a fraction of capacity.
///
/// Zero when the road is empty, strictly increasing, and capped at
/// `1 / SATURATION_MARGIN` once the road is at or beyond capacity so a
/// jammed road stays routable.
pub fn congestion_factor(density: f64) -> f64 {
    let d = density.clamp(0.0, 1.0);
    d / (1.0 + SATURATION_MARGIN - d)
}

/// Static road topology
#[derive(Debug, Default)]
pub struct CityGraph {
    /// The underlying petgraph undirected graph
    graph: UnGraph<Node, Road>,

    /// Maps node IDs to their indices in the graph
    node_index: HashMap<NodeId, NodeIndex>,

    /// Nodes controlled by a traffic light, sorted
    traffic_lights: Vec<NodeId>,

    /// Hospital nodes, sorted
    hospitals: Vec<NodeId>,
}

/// Incremental construction of a [`CityGraph`]
#[derive(Debug, Default)]
pub struct CityGraphBuilder {
    graph: CityGraph,
}

impl CityGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node; adding the same id twice keeps the first
    pub fn add_node(&mut self, id: NodeId, kind: NodeKind) -> &mut Self {
        if self.graph.node_index.contains_key(&id) {
            return self;
        }
        let index = self.graph.graph.add_node(Node { id, kind });
        self.graph.node_index.insert(id, index);
        if kind == NodeKind::Hospital {
            self.graph.hospitals.push(id);
        }
        self
    }

    /// Adds a road between two existing nodes and returns its id
    pub fn add_road(
        &mut self,
        a: NodeId,
        b: NodeId,
        base_weight: f64,
        capacity: u32,
    ) -> Result<EdgeId> {
        if !(base_weight > 0.0 && base_weight.is_finite()) {
            return Err(SimError::Configuration(format!(
                "road {a}-{b} needs a positive base weight, got {base_weight}"
            ))
            .into());
        }
        if capacity == 0 {
            let reason = format!("road {a}-{b} needs a positive capacity");
            return Err(SimError::Configuration(reason).into());
        }
        let ia = *self
            .graph
            .node_index
            .get(&a)
            .with_context(|| format!("Node {a} not found"))?;
        let ib = *self
            .graph
            .node_index
            .get(&b)
            .with_context(|| format!("Node {b} not found"))?;
        if self.graph.graph.find_edge(ia, ib).is_some() {
            bail!("Road {a}-{b} already exists");
        }

        let id = EdgeId(self.graph.graph.edge_count());
        self.graph.graph.add_edge(
            ia,
            ib,
            Road {
                id,
                a,
                b,
                base_weight,
                capacity,
            },
        );
        Ok(id)
    }

    /// Puts a traffic light on a node
    pub fn add_traffic_light(&mut self, node: NodeId) -> Result<&mut Self> {
        if !self.graph.node_index.contains_key(&node) {
            bail!("Cannot place a traffic light on unknown node {node}");
        }
        if !self.graph.traffic_lights.contains(&node) {
            self.graph.traffic_lights.push(node);
        }
        Ok(self)
    }

    pub fn build(mut self) -> CityGraph {
        self.graph.traffic_lights.sort();
        self.graph.hospitals.sort();
        self.graph
    }
}

impl CityGraph {
    /// Builds the rectangular grid described by the configuration
    pub fn grid(config: &SimConfig) -> Result<Self> {
        config.validate()?;

        let hospitals = match &config.hospitals {
            Some(hospitals) => hospitals.clone(),
            None => default_hospitals(config.width, config.height),
        };

        let mut builder = CityGraphBuilder::new();
        for x in 0..config.width {
            for y in 0..config.height {
                let id = NodeId::new(x, y);
                let kind = if hospitals.contains(&id) {
                    NodeKind::Hospital
                } else {
                    NodeKind::Intersection
                };
                builder.add_node(id, kind);
            }
        }

        for x in 0..config.width {
            for y in 0..config.height {
                let here = NodeId::new(x, y);
                let mut link = |there: NodeId| -> Result<()> {
                    let capacity = config
                        .capacity_overrides
                        .iter()
                        .find(|(a, b, _)| {
                            (*a == here && *b == there) || (*a == there && *b == here)
                        })
                        .map(|(_, _, cap)| *cap)
                        .unwrap_or(config.default_capacity);
                    builder.add_road(here, there, config.base_weight, capacity)?;
                    Ok(())
                };
                if x + 1 < config.width {
                    link(NodeId::new(x + 1, y))?;
                }
                if y + 1 < config.height {
                    link(NodeId::new(x, y + 1))?;
                }
            }
        }

        for x in (0..config.width).step_by(config.light_spacing as usize) {
            for y in (0..config.height).step_by(config.light_spacing as usize) {
                builder.add_traffic_light(NodeId::new(x, y))?;
            }
        }

        Ok(builder.build())
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.node_index.get(&id).map(|index| &self.graph[*index])
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node_index.contains_key(&id)
    }

    /// Gets a road by ID
    pub fn edge(&self, id: EdgeId) -> Option<&Road> {
        self.graph.edge_weight(EdgeIndex::new(id.0))
    }

    /// Gets a road by ID, treating an unknown id as a broken invariant
    ///
    /// # Panics
    /// Panics when the edge does not exist.
    pub fn road(&self, id: EdgeId) -> &Road {
        match self.edge(id) {
            Some(road) => road,
            None => panic!("edge {id} does not exist in the city graph"),
        }
    }

    /// Finds the road connecting two nodes
    pub fn edge_between(&self, a: NodeId, b: NodeId) -> Option<EdgeId> {
        let ia = self.node_index.get(&a)?;
        let ib = self.node_index.get(&b)?;
        self.graph
            .find_edge(*ia, *ib)
            .map(|edge| self.graph[edge].id)
    }

    /// Roads leaving a node with the node across each, sorted by that node
    pub fn neighbors(&self, node: NodeId) -> Vec<(EdgeId, NodeId)> {
        let Some(index) = self.node_index.get(&node) else {
            return Vec::new();
        };
        let mut connections: Vec<(EdgeId, NodeId)> = self
            .graph
            .edges(*index)
            .map(|edge| {
                let road = edge.weight();
                (road.id, road.other_end(node))
            })
            .collect();
        connections.sort_by_key(|(_, other)| *other);
        connections
    }

    /// All roads, ordered by id
    pub fn edges(&self) -> impl Iterator<Item = &Road> {
        self.graph.edge_weights()
    }

    /// All nodes
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn traffic_lights(&self) -> &[NodeId] {
        &self.traffic_lights
    }

    pub fn has_traffic_light(&self, node: NodeId) -> bool {
        self.traffic_lights.binary_search(&node).is_ok()
    }

    pub fn hospitals(&self) -> &[NodeId] {
        &self.hospitals
    }

    /// Closest hospital by Manhattan distance, ties to the smaller id
    pub fn nearest_hospital(&self, from: NodeId) -> Option<NodeId> {
        self.hospitals
            .iter()
            .min_by_key(|h| (h.manhattan(&from), **h))
            .copied()
    }

    /// Smallest base weight of any road
    pub fn min_base_weight(&self) -> f64 {
        self.edges()
            .map(|road| road.base_weight)
            .fold(f64::INFINITY, f64::min)
    }

    /// Capacities indexed by edge id
    pub fn capacities(&self) -> Vec<u32> {
        self.edges().map(|road| road.capacity).collect()
    }

    /// Routing weight of an edge after incident and congestion penalties.
    ///
    /// `base * (1 + incident_penalty) * (1 + congestion_factor(density))`,
    /// which is never below the base weight.
    ///
    /// # Panics
    /// Panics on an unknown edge.
    pub fn effective_cost(
        &self,
        edge: EdgeId,
        at: SimTime,
        events: &EventManager,
        occupancy: &OccupancyTracker,
        policy: SeverityPolicy,
    ) -> f64 {
        let road = self.road(edge);
        let incident_penalty = events.penalty(edge, at, policy);
        let congestion = congestion_factor(occupancy.density(edge));
        road.base_weight * (1.0 + incident_penalty) * (1.0 + congestion)
    }
}

/// Three hospitals spread over the grid, clamped and deduplicated
fn default_hospitals(width: u32, height: u32) -> Vec<NodeId> {
    let clamp = |x: i64, y: i64| {
        NodeId::new(
            x.clamp(0, i64::from(width) - 1) as u32,
            y.clamp(0, i64::from(height) - 1) as u32,
        )
    };
    let (w, h) = (i64::from(width), i64::from(height));
    let mut hospitals = vec![
        clamp(2, h - 2),
        clamp(w - 3, h - 3),
        clamp(w / 2, h / 2),
    ];
    hospitals.sort();
    hospitals.dedup();
    hospitals
}
