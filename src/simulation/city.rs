//! The shared city environment
//!
//! Groups the static graph with the two live cost inputs. Agents share one
//! `Arc<City>`; mutation goes through the per-edge locks inside the trackers.

use anyhow::Result;
use std::sync::Arc;

use super::city_graph::CityGraph;
use super::config::SimConfig;
use super::error::SimError;
use super::events::{EventManager, SeverityPolicy};
use super::occupancy::OccupancyTracker;
use super::types::{EdgeId, SimTime};

#[derive(Debug)]
pub struct City {
    pub graph: CityGraph,
    pub events: EventManager,
    pub occupancy: OccupancyTracker,
    pub policy: SeverityPolicy,
}

impl City {
    /// Wraps an already built graph with fresh trackers
    pub fn new(graph: CityGraph, ema_alpha: f64, policy: SeverityPolicy) -> Self {
        let events = EventManager::new(graph.edge_count());
        let occupancy = OccupancyTracker::new(graph.capacities(), ema_alpha);
        Self {
            graph,
            events,
            occupancy,
            policy,
        }
    }

    /// Builds the grid city described by the configuration
    pub fn from_config(config: &SimConfig) -> Result<Arc<Self>> {
        let graph = CityGraph::grid(config)?;
        if config.emergency_count > 0 && graph.hospitals().is_empty() {
            return Err(SimError::Configuration(
                "emergency vehicles need at least one hospital".to_string(),
            )
            .into());
        }
        Ok(Arc::new(Self::new(
            graph,
            config.ema_alpha,
            config.severity_policy,
        )))
    }

    /// Routing weight of an edge at `at`
    ///
    /// # Panics
    /// Panics on an unknown edge.
    pub fn effective_cost(&self, edge: EdgeId, at: SimTime) -> f64 {
        self.graph
            .effective_cost(edge, at, &self.events, &self.occupancy, self.policy)
    }

    /// Routing weight at the event manager's current time
    pub fn current_cost(&self, edge: EdgeId) -> f64 {
        self.effective_cost(edge, self.events.now())
    }

    /// Mean congestion over every road, the `rho` metric
    pub fn average_density(&self) -> f64 {
        self.occupancy.average_density()
    }
}
