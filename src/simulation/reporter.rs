//! Random incident source
//!
//! Every round the reporter may pick a few roads that are not already
//! blocked and report incidents on them to the incident desk.

use log::debug;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use super::agent::{Agent, AgentContext};
use super::city::City;
use super::config::SimConfig;
use super::error::SimError;
use super::protocol::{Envelope, Message};
use super::types::{AgentId, EdgeId, SimTime};

#[derive(Debug)]
pub struct IncidentReporterAgent {
    city: Arc<City>,
    rng: StdRng,
    interval: f64,
    probability: f64,
    max_per_round: usize,
    severity: f64,
    ttl: f64,
    next_round: SimTime,
    reported: usize,
}

impl IncidentReporterAgent {
    pub fn new(city: Arc<City>, config: &SimConfig, seed: u64) -> Self {
        Self {
            city,
            rng: StdRng::seed_from_u64(seed),
            interval: config.incident_interval,
            probability: config.incident_probability,
            max_per_round: config.max_incidents_per_round,
            severity: config.incident_severity,
            ttl: config.incident_ttl,
            next_round: config.incident_interval,
            reported: 0,
        }
    }

    /// Incidents reported so far
    pub fn reported(&self) -> usize {
        self.reported
    }

    /// Roads chosen for this round, possibly none
    pub fn pick_edges(&mut self) -> Vec<EdgeId> {
        if self.max_per_round == 0 || !self.rng.random_bool(self.probability) {
            return Vec::new();
        }
        let candidates: Vec<EdgeId> = self
            .city
            .graph
            .edges()
            .map(|road| road.id)
            .filter(|edge| !self.city.events.is_blocked(*edge))
            .collect();
        let count = self.rng.random_range(1..=self.max_per_round);
        let mut picked: Vec<EdgeId> = candidates
            .choose_multiple(&mut self.rng, count)
            .copied()
            .collect();
        picked.sort();
        picked
    }
}

impl Agent for IncidentReporterAgent {
    fn id(&self) -> AgentId {
        AgentId::IncidentReporter
    }

    fn on_message(&mut self, envelope: Envelope, _ctx: &mut AgentContext) -> Result<(), SimError> {
        Err(SimError::ProtocolViolation(format!(
            "incident reporter got unexpected {} from {}",
            envelope.message.kind(),
            envelope.from
        )))
    }

    fn on_tick(&mut self, ctx: &mut AgentContext) -> Result<(), SimError> {
        let edges = self.pick_edges();
        if !edges.is_empty() {
            debug!("Reporting incidents on {edges:?}");
        }
        for edge in edges {
            ctx.send(
                AgentId::IncidentDesk,
                Message::IncidentReport {
                    edge,
                    severity: self.severity,
                    ttl: self.ttl,
                },
            );
            self.reported += 1;
        }
        self.next_round = ctx.now + self.interval;
        Ok(())
    }

    fn next_wake(&self) -> Option<SimTime> {
        Some(self.next_round)
    }
}
