//! Per-edge vehicle counts and smoothed congestion density

use log::warn;
use std::collections::BTreeSet;
use std::sync::Mutex;

use super::error::SimError;
use super::events::lock;
use super::types::{EdgeId, VehicleId};

/// Occupancy of a single edge
#[derive(Debug, Default, Clone)]
pub struct OccupancyRecord {
    /// Vehicles currently on the edge; the count is the set size
    pub vehicles: BTreeSet<VehicleId>,
    /// Exponential moving average of `count / capacity`
    pub ema_density: f64,
}

impl OccupancyRecord {
    pub fn count(&self) -> usize {
        self.vehicles.len()
    }
}

/// Tracks which vehicles use which edge
#[derive(Debug)]
pub struct OccupancyTracker {
    records: Vec<Mutex<OccupancyRecord>>,
    capacities: Vec<u32>,
    alpha: f64,
}

impl OccupancyTracker {
    /// `capacities[i]` is the capacity of edge `i`
    pub fn new(capacities: Vec<u32>, alpha: f64) -> Self {
        Self {
            records: capacities
                .iter()
                .map(|_| Mutex::new(OccupancyRecord::default()))
                .collect(),
            capacities,
            alpha,
        }
    }

    fn record(&self, edge: EdgeId) -> Result<&Mutex<OccupancyRecord>, SimError> {
        self.records
            .get(edge.0)
            .ok_or_else(|| SimError::ProtocolViolation(format!("unknown edge {edge}")))
    }

    /// Register a vehicle on an edge; entering twice counts once
    pub fn enter(&self, edge: EdgeId, vehicle: &VehicleId) -> Result<(), SimError> {
        lock(self.record(edge)?).vehicles.insert(vehicle.clone());
        Ok(())
    }

    /// Remove a vehicle from an edge.
    ///
    /// Leaving an edge the vehicle never entered is logged and ignored, so
    /// the count never drops below zero.
    pub fn exit(&self, edge: EdgeId, vehicle: &VehicleId) -> Result<(), SimError> {
        if !lock(self.record(edge)?).vehicles.remove(vehicle) {
            let anomaly = SimError::AnomalousOccupancy {
                edge,
                vehicle: vehicle.to_string(),
            };
            warn!("{anomaly}");
        }
        Ok(())
    }

    /// Drop a vehicle from every edge, used when it leaves the simulation
    pub fn release_all(&self, vehicle: &VehicleId) {
        for record in &self.records {
            lock(record).vehicles.remove(vehicle);
        }
    }

    /// Update the smoothed density of every edge from its current count.
    ///
    /// Runs on the maintenance cadence, not on enter/exit.
    pub fn sample_tick(&self, _elapsed: f64) {
        for (record, capacity) in self.records.iter().zip(&self.capacities) {
            let mut record = lock(record);
            let instantaneous = record.count() as f64 / f64::from(*capacity);
            record.ema_density += self.alpha * (instantaneous - record.ema_density);
        }
    }

    pub fn count(&self, edge: EdgeId) -> usize {
        self.record(edge).map(|r| lock(r).count()).unwrap_or(0)
    }

    /// Smoothed density used for routing costs.
    ///
    /// # Panics
    /// Panics on an unknown edge.
    pub fn density(&self, edge: EdgeId) -> f64 {
        lock(&self.records[edge.0]).ema_density
    }

    /// `count / capacity` right now, without smoothing
    pub fn instantaneous_density(&self, edge: EdgeId) -> f64 {
        match self.capacities.get(edge.0) {
            Some(capacity) => self.count(edge) as f64 / f64::from(*capacity),
            None => 0.0,
        }
    }

    /// Whether the edge holds as many vehicles as its capacity
    pub fn is_full(&self, edge: EdgeId) -> bool {
        self.instantaneous_density(edge) >= 1.0
    }

    /// Mean smoothed density over all edges
    pub fn average_density(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        let total: f64 = self.records.iter().map(|r| lock(r).ema_density).sum();
        total / self.records.len() as f64
    }

    /// Vehicles currently on an edge
    pub fn vehicles_on(&self, edge: EdgeId) -> Vec<VehicleId> {
        self.record(edge)
            .map(|r| lock(r).vehicles.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        self.records.len()
    }
}
