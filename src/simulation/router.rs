//! Least-cost routing over dynamic edge costs

use log::debug;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use super::city::City;
use super::error::SimError;
use super::types::{EdgeId, NodeId, SimTime};

/// Relative slack allowed before equal-looking costs are told apart
const COST_EPSILON: f64 = 1e-9;

/// A planned path and the cost of each edge when it was planned
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Nodes from origin to destination, both included
    pub nodes: Vec<NodeId>,
    /// `edges[i]` joins `nodes[i]` and `nodes[i + 1]`
    pub edges: Vec<EdgeId>,
    /// Effective cost of each edge at planning time
    pub planned_costs: Vec<f64>,
    pub total_cost: f64,
}

impl Route {
    pub fn origin(&self) -> NodeId {
        self.nodes[0]
    }

    pub fn destination(&self) -> NodeId {
        self.nodes[self.nodes.len() - 1]
    }

    pub fn hops(&self) -> usize {
        self.edges.len()
    }
}

/// Search label: cost first, then hop count, then the node sequence itself
type Label = (OrderedFloat<f64>, usize, Vec<NodeId>);

/// Dijkstra router over [`City::effective_cost`]
#[derive(Debug, Clone, Copy)]
pub struct Router<'a> {
    city: &'a City,
    reroute_threshold: f64,
}

impl<'a> Router<'a> {
    pub fn new(city: &'a City, reroute_threshold: f64) -> Self {
        Self {
            city,
            reroute_threshold,
        }
    }

    /// Least-cost path from `origin` to `destination` with costs taken at `at`.
    ///
    /// Equal-cost paths are resolved by fewer hops, then by the
    /// lexicographically smaller node sequence, so repeated calls on the
    /// same state give the same route.
    pub fn shortest_path(
        &self,
        origin: NodeId,
        destination: NodeId,
        at: SimTime,
    ) -> Result<Route, SimError> {
        let graph = &self.city.graph;
        let failure = SimError::RoutingFailure {
            origin,
            destination,
        };
        if !graph.contains(origin) || !graph.contains(destination) {
            return Err(failure);
        }

        let mut best: HashMap<NodeId, Label> = HashMap::new();
        let mut heap: BinaryHeap<Reverse<Label>> = BinaryHeap::new();
        let start: Label = (OrderedFloat(0.0), 0, vec![origin]);
        best.insert(origin, start.clone());
        heap.push(Reverse(start));

        while let Some(Reverse(label)) = heap.pop() {
            let node = label.2[label.2.len() - 1];
            if best.get(&node).is_some_and(|known| *known < label) {
                continue;
            }
            if node == destination {
                return Ok(self.build_route(label.2, at));
            }

            for (edge, next) in graph.neighbors(node) {
                if label.2.contains(&next) {
                    continue;
                }
                let cost = label.0 .0 + self.city.effective_cost(edge, at);
                let mut path = label.2.clone();
                path.push(next);
                let candidate: Label = (OrderedFloat(quantize(cost)), label.1 + 1, path);
                if best.get(&next).is_none_or(|known| candidate < *known) {
                    best.insert(next, candidate.clone());
                    heap.push(Reverse(candidate));
                }
            }
        }

        Err(failure)
    }

    fn build_route(&self, nodes: Vec<NodeId>, at: SimTime) -> Route {
        let edges: Vec<EdgeId> = nodes
            .windows(2)
            .filter_map(|pair| self.city.graph.edge_between(pair[0], pair[1]))
            .collect();
        let planned_costs: Vec<f64> = edges
            .iter()
            .map(|edge| self.city.effective_cost(*edge, at))
            .collect();
        let total_cost = planned_costs.iter().sum();
        debug!(
            "Planned {} -> {} over {} hops, cost {:.3}",
            nodes[0],
            nodes[nodes.len() - 1],
            edges.len(),
            total_cost
        );
        Route {
            nodes,
            edges,
            planned_costs,
            total_cost,
        }
    }

    /// Total cost of a route with costs taken at `at`
    pub fn route_cost(&self, route: &Route, at: SimTime) -> f64 {
        route
            .edges
            .iter()
            .map(|edge| self.city.effective_cost(*edge, at))
            .sum()
    }

    /// Whether an edge still ahead on the route (from edge index
    /// `from_index` on) has become materially more expensive than planned
    pub fn is_invalidated(&self, route: &Route, from_index: usize, at: SimTime) -> bool {
        route
            .edges
            .iter()
            .zip(&route.planned_costs)
            .skip(from_index)
            .any(|(edge, planned)| {
                let now = self.city.effective_cost(*edge, at);
                now > planned * (1.0 + self.reroute_threshold) + COST_EPSILON
            })
    }
}

/// Rounds accumulated costs so float noise cannot break exact ties
fn quantize(cost: f64) -> f64 {
    (cost / COST_EPSILON).round() * COST_EPSILON
}
