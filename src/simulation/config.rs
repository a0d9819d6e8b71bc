//! Configuration surface of the simulation
//!
//! Every tunable the core uses is a field here; constructors take a
//! `SimConfig` instead of reading hardcoded constants.

use super::error::SimError;
use super::events::SeverityPolicy;
use super::types::NodeId;

/// Simulation parameters
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of grid columns
    pub width: u32,
    /// Number of grid rows
    pub height: u32,
    /// Ordinary vehicles to spawn
    pub vehicle_count: usize,
    /// Emergency vehicles to spawn
    pub emergency_count: usize,
    /// A traffic light sits on every node whose coordinates are both multiples of this
    pub light_spacing: u32,
    /// Capacity of every edge without an override
    pub default_capacity: u32,
    /// Per-edge capacities, keyed by the edge's endpoints
    pub capacity_overrides: Vec<(NodeId, NodeId, u32)>,
    /// Base routing weight of every edge
    pub base_weight: f64,
    /// Explicit hospital positions; `None` uses the default layout
    pub hospitals: Option<Vec<NodeId>>,
    /// EMA smoothing factor for edge density, in (0, 1)
    pub ema_alpha: f64,
    /// How overlapping incidents on one edge combine
    pub severity_policy: SeverityPolicy,

    /// Seconds between reporter rounds
    pub incident_interval: f64,
    /// Chance that a reporter round emits anything
    pub incident_probability: f64,
    /// Upper bound on incidents emitted per round
    pub max_incidents_per_round: usize,
    /// Lifetime of a reported incident, in seconds
    pub incident_ttl: f64,
    /// Severity of a reported incident
    pub incident_severity: f64,

    /// Back-off a traffic light asks of denied vehicles, in seconds
    pub retry_after: f64,
    /// Upper bound on an emergency vehicle's back-off, in seconds
    pub emergency_backoff: f64,
    /// How long a vehicle waits for any reply before re-requesting
    pub request_timeout: f64,
    /// Time to cross a controlled intersection once granted
    pub crossing_time: f64,
    /// Seconds of travel per unit of effective edge cost
    pub seconds_per_cost: f64,
    /// A grant held longer than this is revoked
    pub max_grant_hold: f64,
    /// Pause at a destination before the next trip
    pub dwell_time: f64,
    /// Whether vehicles start a new trip after arriving
    pub roaming: bool,
    /// Relative cost increase on a planned edge that forces a reroute
    pub reroute_threshold: f64,

    /// Cadence of the maintenance loop, in seconds
    pub sample_interval: f64,
    /// Purge expired incidents every this many maintenance ticks
    pub sweep_every: u32,
    /// Density above which congestion is broadcast to vehicles
    pub congestion_threshold: f64,

    /// Seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            width: 20,
            height: 20,
            vehicle_count: 10,
            emergency_count: 5,
            light_spacing: 4,
            default_capacity: 5,
            capacity_overrides: Vec::new(),
            base_weight: 1.0,
            hospitals: None,
            ema_alpha: 0.3,
            severity_policy: SeverityPolicy::Max,
            incident_interval: 3.0,
            incident_probability: 0.4,
            max_incidents_per_round: 3,
            incident_ttl: 8.0,
            incident_severity: 10.0,
            retry_after: 0.5,
            emergency_backoff: 0.1,
            request_timeout: 0.8,
            crossing_time: 0.25,
            seconds_per_cost: 1.0,
            max_grant_hold: 5.0,
            dwell_time: 3.0,
            roaming: true,
            reroute_threshold: 0.5,
            sample_interval: 0.5,
            sweep_every: 10,
            congestion_threshold: 0.8,
            seed: None,
        }
    }
}

impl SimConfig {
    /// A small grid used by tests and demos
    pub fn small(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            vehicle_count: 0,
            emergency_count: 0,
            light_spacing: 2,
            ..Self::default()
        }
    }

    /// Check the parameters before anything is built from them
    pub fn validate(&self) -> Result<(), SimError> {
        if self.width == 0 || self.height == 0 {
            return Err(SimError::Configuration(format!(
                "grid must be at least 1x1, got {}x{}",
                self.width, self.height
            )));
        }
        if u64::from(self.width) * u64::from(self.height) < 2 {
            return Err(SimError::Configuration(
                "grid needs at least two nodes".to_string(),
            ));
        }
        if self.default_capacity == 0 {
            return Err(SimError::Configuration(
                "capacity must be positive".to_string(),
            ));
        }
        if let Some((a, b, _)) = self.capacity_overrides.iter().find(|(_, _, cap)| *cap == 0) {
            return Err(SimError::Configuration(format!(
                "capacity override for {a}-{b} must be positive"
            )));
        }
        if !(self.base_weight > 0.0 && self.base_weight.is_finite()) {
            return Err(SimError::Configuration(format!(
                "base weight must be positive, got {}",
                self.base_weight
            )));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha < 1.0) {
            return Err(SimError::Configuration(format!(
                "EMA alpha must lie in (0, 1), got {}",
                self.ema_alpha
            )));
        }
        if self.light_spacing == 0 {
            return Err(SimError::Configuration(
                "traffic light spacing must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.incident_probability) {
            return Err(SimError::Configuration(format!(
                "incident probability must lie in [0, 1], got {}",
                self.incident_probability
            )));
        }
        if !(self.incident_severity >= 0.0 && self.incident_severity.is_finite())
            || !(self.incident_ttl > 0.0 && self.incident_ttl.is_finite())
        {
            return Err(SimError::Configuration(
                "incidents need a non-negative severity and a positive TTL".to_string(),
            ));
        }
        let timings = [
            ("retry_after", self.retry_after),
            ("emergency_backoff", self.emergency_backoff),
            ("request_timeout", self.request_timeout),
            ("incident_interval", self.incident_interval),
            ("sample_interval", self.sample_interval),
            ("max_grant_hold", self.max_grant_hold),
        ];
        if let Some((name, value)) = timings.iter().find(|(_, v)| !(*v > 0.0 && v.is_finite())) {
            return Err(SimError::Configuration(format!(
                "{name} must be positive and finite, got {value}"
            )));
        }
        let durations = [self.crossing_time, self.seconds_per_cost, self.dwell_time];
        if durations.iter().any(|d| !(*d >= 0.0 && d.is_finite())) {
            return Err(SimError::Configuration(
                "durations must be finite and not negative".to_string(),
            ));
        }
        if self.sweep_every == 0 {
            return Err(SimError::Configuration(
                "sweep_every must be positive".to_string(),
            ));
        }
        if let Some(hospitals) = &self.hospitals {
            if let Some(h) = hospitals
                .iter()
                .find(|h| h.x >= self.width || h.y >= self.height)
            {
                return Err(SimError::Configuration(format!(
                    "hospital {h} lies outside the grid"
                )));
            }
        }
        Ok(())
    }
}
