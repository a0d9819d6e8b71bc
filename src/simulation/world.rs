//! Simulation runtime that ties everything together
//!
//! Builds the city from a [`SimConfig`], spawns one task per agent plus the
//! incident desk and the maintenance loop, and collects metrics until it is
//! shut down.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use super::agent::{run_agent, Agent, AgentRuntime, SimAgent};
use super::city::City;
use super::clock::SimulationClock;
use super::config::SimConfig;
use super::error::SimError;
use super::metrics::{drain_records, MetricRecord, MetricsSink, MetricsSummary};
use super::protocol::Message;
use super::reporter::IncidentReporterAgent;
use super::snapshot::{render_map, CitySnapshot, PositionBoard};
use super::traffic_light::{TrafficLight, TrafficLightAgent};
use super::transport::{ChannelTransport, Mailbox, Transport};
use super::types::{AgentId, NodeId, VehicleId, MIN_TRIP_DISTANCE};
use super::vehicle::{
    EmergencyVehicleAgent, VehicleAgent, VehicleRole, VehicleSettings, VehicleStatus,
};

/// Final state of one vehicle
#[derive(Debug, Clone, Serialize)]
pub struct VehicleReport {
    pub id: VehicleId,
    pub role: VehicleRole,
    pub status: VehicleStatus,
    pub trips_completed: usize,
    pub replans: usize,
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub elapsed: f64,
    pub summary: MetricsSummary,
    pub records: Vec<MetricRecord>,
    pub incidents_reported: usize,
    pub vehicles: Vec<VehicleReport>,
    /// City as it was just before the agents stopped
    pub snapshot: CitySnapshot,
}

impl SimulationReport {
    pub fn print_summary(&self) {
        println!("=== Traffic Simulation Summary ===");
        println!("Seed: {}", self.seed);
        println!("Time: {:.2}s", self.elapsed);
        println!("Incidents reported: {}", self.incidents_reported);
        println!("Active incidents at end: {}", self.snapshot.incidents.len());
        println!();

        println!("--- Metrics ---");
        println!("  Trips completed: {}", self.summary.trips_completed);
        if let Some(avg) = self.summary.avg_trip_time {
            println!("  Average trip time: {avg:.2}s");
        }
        println!("  Emergency responses: {}", self.summary.ev_responses);
        if let Some(avg) = self.summary.avg_ev_response {
            println!("  Average response time: {avg:.2}s");
        }
        if let Some(rho) = self.summary.avg_rho {
            println!("  Average density (rho): {rho:.3}");
        }
        println!();

        if !self.vehicles.is_empty() {
            println!("--- Vehicles ---");
            for vehicle in &self.vehicles {
                println!(
                    "  {} ({:?}): {:?}, trips={}, replans={}",
                    vehicle.id,
                    vehicle.role,
                    vehicle.status,
                    vehicle.trips_completed,
                    vehicle.replans
                );
            }
        }
    }
}

/// A running simulation
pub struct SimWorld {
    config: SimConfig,
    seed: u64,
    city: Arc<City>,
    transport: Arc<ChannelTransport>,
    clock: SimulationClock,
    board: Arc<PositionBoard>,
    shutdown: watch::Sender<bool>,
    fatal: UnboundedReceiver<SimError>,
    metrics: UnboundedReceiver<MetricRecord>,
    records: Vec<MetricRecord>,
    agents: JoinSet<SimAgent>,
    services: Vec<JoinHandle<()>>,
}

impl SimWorld {
    /// Builds the city and spawns every agent. Must run inside a tokio runtime.
    pub fn start(config: SimConfig) -> Result<Self> {
        let seed = config.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let city = City::from_config(&config).context("Failed to build the city")?;
        info!(
            "City {}x{}: {} roads, {} lights, {} hospitals (seed {seed})",
            config.width,
            config.height,
            city.graph.edge_count(),
            city.graph.traffic_lights().len(),
            city.graph.hospitals().len()
        );

        let transport = Arc::new(ChannelTransport::new());
        let clock = SimulationClock::start();
        let board = Arc::new(PositionBoard::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal) = mpsc::unbounded_channel();
        let (sink, metrics) = MetricsSink::channel();
        let runtime = AgentRuntime {
            transport: transport.clone(),
            clock,
            shutdown: shutdown_rx.clone(),
            fatal: fatal_tx,
        };

        let mut world = Self {
            config,
            seed,
            city,
            transport,
            clock,
            board,
            shutdown,
            fatal,
            metrics,
            records: Vec::new(),
            agents: JoinSet::new(),
            services: Vec::new(),
        };

        world.spawn_lights(&runtime);
        world.spawn_vehicles(&runtime, &sink, &mut rng)?;
        if world.config.incident_probability > 0.0 && world.config.max_incidents_per_round > 0 {
            let reporter =
                IncidentReporterAgent::new(world.city.clone(), &world.config, rng.random());
            world.spawn(SimAgent::IncidentReporter(reporter), &runtime);
        }

        let desk = world.transport.register(AgentId::IncidentDesk);
        world.services.push(tokio::spawn(run_incident_desk(
            world.city.clone(),
            world.transport.clone(),
            desk,
            shutdown_rx.clone(),
        )));
        world.services.push(tokio::spawn(run_maintenance(
            world.city.clone(),
            world.transport.clone(),
            sink,
            MaintenanceSettings::from_config(&world.config),
            shutdown_rx,
        )));

        Ok(world)
    }

    fn spawn(&mut self, agent: SimAgent, runtime: &AgentRuntime) {
        let mailbox = self.transport.register(agent.id());
        self.agents.spawn(run_agent(agent, mailbox, runtime.clone()));
    }

    fn spawn_lights(&mut self, runtime: &AgentRuntime) {
        let lights: Vec<NodeId> = self.city.graph.traffic_lights().to_vec();
        for node in lights {
            let edges = self
                .city
                .graph
                .neighbors(node)
                .into_iter()
                .map(|(edge, _)| edge)
                .collect();
            let light = TrafficLight::new(
                node,
                edges,
                self.config.retry_after,
                self.config.max_grant_hold,
            );
            let agent = TrafficLightAgent::new(light).with_city(self.city.clone());
            self.spawn(SimAgent::TrafficLight(agent), runtime);
        }
    }

    fn spawn_vehicles(
        &mut self,
        runtime: &AgentRuntime,
        sink: &MetricsSink,
        rng: &mut StdRng,
    ) -> Result<()> {
        let nodes: Vec<NodeId> = self.city.graph.nodes().map(|n| n.id).collect();
        let settings = VehicleSettings::from_config(&self.config);

        for i in 0..self.config.vehicle_count {
            let start = *nodes.choose(rng).context("City has no nodes")?;
            let destination = pick_trip_destination(&nodes, start, rng)
                .context("City has a single node")?;
            let vehicle = VehicleAgent::new(
                VehicleId::new(format!("vehicle_{i}")),
                start,
                destination,
                self.city.clone(),
                settings,
                rng.random(),
            )?
            .with_metrics(sink.clone())
            .with_position_board(self.board.clone());
            debug!("Spawned {} at {start} heading to {destination}", vehicle.vehicle_id());
            self.spawn(SimAgent::Vehicle(vehicle), runtime);
        }

        for i in 0..self.config.emergency_count {
            let start = *nodes.choose(rng).context("City has no nodes")?;
            let vehicle = EmergencyVehicleAgent::to_nearest_hospital(
                VehicleId::new(format!("ev_{i}")),
                start,
                self.city.clone(),
                settings,
                rng.random(),
            )?
            .with_metrics(sink.clone())
            .with_position_board(self.board.clone());
            self.spawn(SimAgent::EmergencyVehicle(vehicle), runtime);
        }
        Ok(())
    }

    pub fn city(&self) -> &Arc<City> {
        &self.city
    }

    pub fn transport(&self) -> &Arc<ChannelTransport> {
        &self.transport
    }

    pub fn positions(&self) -> &Arc<PositionBoard> {
        &self.board
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Seconds since the world started
    pub fn elapsed(&self) -> f64 {
        self.clock.now()
    }

    pub fn snapshot(&self) -> CitySnapshot {
        CitySnapshot::capture(&self.city, &self.board)
    }

    /// Draw a map of the city in the terminal
    pub fn draw_map(&self) {
        println!("\n=== City Map (t={:.1}s) ===", self.elapsed());
        println!("{}", render_map(&self.city, &self.board, self.config.congestion_threshold));
    }

    /// Metric records produced so far
    pub fn records(&mut self) -> &[MetricRecord] {
        self.records.extend(drain_records(&mut self.metrics));
        &self.records
    }

    /// Lets the simulation run for `duration`, stopping early on a fatal error
    pub async fn run_for(&mut self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            Some(e) = self.fatal.recv() => {
                error!("Stopping simulation: {e}");
                Err(e).context("Simulation hit a fatal error")
            }
        }
    }

    /// Stops every task and gathers the final report
    pub async fn shutdown(mut self) -> SimulationReport {
        let snapshot = self.snapshot();
        let elapsed = self.elapsed();
        let _ = self.shutdown.send(true);

        let mut vehicles = Vec::new();
        let mut incidents_reported = 0;
        while let Some(joined) = self.agents.join_next().await {
            match joined {
                Ok(SimAgent::Vehicle(v)) => vehicles.push(vehicle_report(&v)),
                Ok(SimAgent::EmergencyVehicle(ev)) => vehicles.push(vehicle_report(ev.vehicle())),
                Ok(SimAgent::IncidentReporter(r)) => incidents_reported = r.reported(),
                Ok(SimAgent::TrafficLight(_)) => {}
                Err(e) => warn!("Agent task failed: {e}"),
            }
        }
        for service in self.services.drain(..) {
            if let Err(e) = service.await {
                warn!("Service task failed: {e}");
            }
        }
        vehicles.sort_by(|a, b| a.id.cmp(&b.id));

        self.records.extend(drain_records(&mut self.metrics));
        SimulationReport {
            seed: self.seed,
            elapsed,
            summary: MetricsSummary::from_records(&self.records),
            records: self.records,
            incidents_reported,
            vehicles,
            snapshot,
        }
    }
}

fn vehicle_report(vehicle: &VehicleAgent) -> VehicleReport {
    VehicleReport {
        id: vehicle.vehicle_id().clone(),
        role: vehicle.role(),
        status: vehicle.status(),
        trips_completed: vehicle.trips_completed(),
        replans: vehicle.replans(),
    }
}

/// A destination far enough from `start` to make a real trip, when the
/// grid allows one
fn pick_trip_destination(nodes: &[NodeId], start: NodeId, rng: &mut StdRng) -> Option<NodeId> {
    let far: Vec<NodeId> = nodes
        .iter()
        .copied()
        .filter(|n| n.manhattan(&start) >= MIN_TRIP_DISTANCE)
        .collect();
    if let Some(node) = far.choose(rng) {
        return Some(*node);
    }
    let others: Vec<NodeId> = nodes.iter().copied().filter(|n| *n != start).collect();
    others.choose(rng).copied()
}

/// Records incident reports and tells every vehicle about them
async fn run_incident_desk(
    city: Arc<City>,
    transport: Arc<ChannelTransport>,
    mut mailbox: Mailbox,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            envelope = mailbox.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        match &envelope.message {
            Message::IncidentReport {
                edge,
                severity,
                ttl,
            } => match city.events.report(*edge, *severity, *ttl) {
                Ok(_) => {
                    let notified =
                        transport.broadcast_to_vehicles(&AgentId::IncidentDesk, &envelope.message);
                    debug!("Incident on {edge} broadcast to {notified} vehicles");
                }
                Err(e) => warn!("{e}"),
            },
            other => warn!(
                "{}",
                SimError::ProtocolViolation(format!(
                    "incident desk got unexpected {} from {}",
                    other.kind(),
                    envelope.from
                ))
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MaintenanceSettings {
    sample_interval: f64,
    sweep_every: u32,
    congestion_threshold: f64,
}

impl MaintenanceSettings {
    fn from_config(config: &SimConfig) -> Self {
        Self {
            sample_interval: config.sample_interval,
            sweep_every: config.sweep_every,
            congestion_threshold: config.congestion_threshold,
        }
    }
}

/// Advances incident time, samples densities, purges expired incidents and
/// reports roads that just became congested
async fn run_maintenance(
    city: Arc<City>,
    transport: Arc<ChannelTransport>,
    metrics: MetricsSink,
    settings: MaintenanceSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_secs_f64(settings.sample_interval);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut congested = vec![false; city.graph.edge_count()];
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }
        ticks += 1;

        let expired = city.events.tick(settings.sample_interval);
        if expired > 0 {
            debug!("{expired} incidents expired");
        }
        city.occupancy.sample_tick(settings.sample_interval);
        if ticks % u64::from(settings.sweep_every) == 0 {
            city.events.sweep();
        }
        metrics.rho(city.average_density());

        for road in city.graph.edges() {
            let density = city.occupancy.density(road.id);
            let is_congested = density >= settings.congestion_threshold;
            let slot = &mut congested[road.id.0];
            if is_congested && !*slot {
                info!("Road {} congested (density {density:.2})", road.id);
                transport.broadcast_to_vehicles(
                    &AgentId::IncidentDesk,
                    &Message::CongestionReport {
                        edge: road.id,
                        observed_density: density,
                    },
                );
            }
            *slot = is_congested;
        }
    }
}
