//! Vehicle and emergency vehicle agents
//!
//! A vehicle plans with the router, asks the light at each controlled node
//! before entering the next road, backs off when denied and replans from
//! wherever it is when its route gets materially more expensive.

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;

use super::agent::{Agent, AgentContext};
use super::city::City;
use super::config::SimConfig;
use super::error::SimError;
use super::metrics::MetricsSink;
use super::protocol::{Envelope, Message};
use super::router::{Route, Router};
use super::snapshot::{AgentPosition, PositionBoard};
use super::types::{AgentId, EdgeId, NodeId, NodeKind, SimTime, VehicleId, MIN_TRIP_DISTANCE};

/// Externally visible state of a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VehicleStatus {
    Idle,
    Planning,
    Traveling,
    Waiting,
    Arrived,
}

/// Whether a vehicle drives with the emergency flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VehicleRole {
    Normal,
    Emergency,
}

/// What the vehicle is doing between two decisions
#[derive(Debug, Clone, Copy, PartialEq)]
enum Leg {
    /// Standing on a node with nothing outstanding
    AtNode,
    AwaitingGrant {
        edge: EdgeId,
        next: NodeId,
        resend_at: SimTime,
    },
    BackingOff {
        edge: EdgeId,
        next: NodeId,
        until: SimTime,
    },
    Crossing {
        edge: EdgeId,
        next: NodeId,
        until: SimTime,
    },
    OnEdge {
        edge: EdgeId,
        next: NodeId,
        until: SimTime,
    },
    Dwelling {
        until: SimTime,
    },
}

/// Timing parameters a vehicle needs from the configuration
#[derive(Debug, Clone, Copy)]
pub struct VehicleSettings {
    pub crossing_time: f64,
    pub seconds_per_cost: f64,
    pub request_timeout: f64,
    pub emergency_backoff: f64,
    pub dwell_time: f64,
    pub roaming: bool,
    pub reroute_threshold: f64,
}

impl VehicleSettings {
    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            crossing_time: config.crossing_time,
            seconds_per_cost: config.seconds_per_cost,
            request_timeout: config.request_timeout,
            emergency_backoff: config.emergency_backoff,
            dwell_time: config.dwell_time,
            roaming: config.roaming,
            reroute_threshold: config.reroute_threshold,
        }
    }
}

/// An ordinary vehicle; emergency vehicles wrap one with the priority role
#[derive(Debug)]
pub struct VehicleAgent {
    id: VehicleId,
    role: VehicleRole,
    city: Arc<City>,
    settings: VehicleSettings,
    metrics: MetricsSink,
    board: Option<Arc<PositionBoard>>,
    rng: StdRng,

    position: NodeId,
    current_edge: Option<EdgeId>,
    destination: Option<NodeId>,
    route: Option<Route>,
    /// Index into `route.edges` of the next road to take
    route_index: usize,
    status: VehicleStatus,
    leg: Leg,
    wake_at: Option<SimTime>,
    trip_started: Option<SimTime>,
    reroute_pending: bool,
    trips_completed: usize,
    replans: usize,
}

impl VehicleAgent {
    pub fn new(
        id: VehicleId,
        start: NodeId,
        destination: NodeId,
        city: Arc<City>,
        settings: VehicleSettings,
        seed: u64,
    ) -> Result<Self, SimError> {
        for node in [start, destination] {
            if !city.graph.contains(node) {
                return Err(SimError::Configuration(format!(
                    "vehicle {id} references node {node} outside the grid"
                )));
            }
        }
        Ok(Self {
            id,
            role: VehicleRole::Normal,
            city,
            settings,
            metrics: MetricsSink::disabled(),
            board: None,
            rng: StdRng::seed_from_u64(seed),
            position: start,
            current_edge: None,
            destination: Some(destination),
            route: None,
            route_index: 0,
            status: VehicleStatus::Idle,
            leg: Leg::AtNode,
            wake_at: Some(0.0),
            trip_started: None,
            reroute_pending: false,
            trips_completed: 0,
            replans: 0,
        })
    }

    pub fn with_metrics(mut self, metrics: MetricsSink) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_position_board(mut self, board: Arc<PositionBoard>) -> Self {
        self.board = Some(board);
        self.publish();
        self
    }

    pub fn vehicle_id(&self) -> &VehicleId {
        &self.id
    }

    pub fn role(&self) -> VehicleRole {
        self.role
    }

    pub fn status(&self) -> VehicleStatus {
        self.status
    }

    pub fn position(&self) -> NodeId {
        self.position
    }

    pub fn current_edge(&self) -> Option<EdgeId> {
        self.current_edge
    }

    pub fn destination(&self) -> Option<NodeId> {
        self.destination
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn trips_completed(&self) -> usize {
        self.trips_completed
    }

    pub fn replans(&self) -> usize {
        self.replans
    }

    fn is_priority(&self) -> bool {
        self.role == VehicleRole::Emergency
    }

    fn agent_id(&self) -> AgentId {
        AgentId::vehicle(&self.id)
    }

    fn publish(&self) {
        if let Some(board) = &self.board {
            board.update(
                self.id.clone(),
                AgentPosition {
                    node: self.position,
                    edge: self.current_edge,
                    status: self.status,
                    role: self.role,
                },
            );
        }
    }

    fn set_leg(&mut self, leg: Leg) {
        self.leg = leg;
        self.wake_at = match leg {
            Leg::AtNode => None,
            Leg::AwaitingGrant { resend_at, .. } => Some(resend_at),
            Leg::BackingOff { until, .. }
            | Leg::Crossing { until, .. }
            | Leg::OnEdge { until, .. }
            | Leg::Dwelling { until } => Some(until),
        };
        self.status = match leg {
            Leg::AtNode => self.status,
            Leg::BackingOff { .. } => VehicleStatus::Waiting,
            Leg::Dwelling { .. } => VehicleStatus::Arrived,
            _ => VehicleStatus::Traveling,
        };
        self.publish();
    }

    /// Light that guards the road ahead, if the current node has one
    fn light_here(&self) -> Option<AgentId> {
        self.city
            .graph
            .has_traffic_light(self.position)
            .then_some(AgentId::TrafficLight(self.position))
    }

    fn request_passage(&mut self, edge: EdgeId, next: NodeId, ctx: &mut AgentContext) {
        if let Some(light) = self.light_here() {
            ctx.send(
                light,
                Message::PassageRequest {
                    vehicle_id: self.id.clone(),
                    edge,
                    priority: self.is_priority(),
                },
            );
        }
        self.set_leg(Leg::AwaitingGrant {
            edge,
            next,
            resend_at: ctx.now + self.settings.request_timeout,
        });
    }

    fn release_passage(&self, edge: EdgeId, ctx: &mut AgentContext) {
        if let Some(light) = self.light_here() {
            ctx.send(
                light,
                Message::PassageRelease {
                    vehicle_id: self.id.clone(),
                    edge,
                },
            );
        }
    }

    fn plan(&mut self, destination: NodeId) -> Result<(), SimError> {
        self.status = VehicleStatus::Planning;
        let router = Router::new(&self.city, self.settings.reroute_threshold);
        let route = router.shortest_path(self.position, destination, self.city.events.now())?;
        debug!(
            "{} planned {} hops to {destination} (cost {:.2})",
            self.id,
            route.hops(),
            route.total_cost
        );
        self.route = Some(route);
        self.route_index = 0;
        self.reroute_pending = false;
        self.replans += 1;
        Ok(())
    }

    fn route_needs_replan(&self) -> bool {
        match &self.route {
            None => true,
            Some(route) => {
                self.reroute_pending
                    || route.nodes.get(self.route_index) != Some(&self.position)
                    || Router::new(&self.city, self.settings.reroute_threshold).is_invalidated(
                        route,
                        self.route_index,
                        self.city.events.now(),
                    )
            }
        }
    }

    /// Decide the next move from a node
    fn advance(&mut self, ctx: &mut AgentContext) -> Result<(), SimError> {
        let Some(destination) = self.destination else {
            self.status = VehicleStatus::Idle;
            self.set_leg(Leg::AtNode);
            return Ok(());
        };
        if self.trip_started.is_none() {
            self.trip_started = Some(ctx.now);
        }
        if self.position == destination {
            self.arrive(ctx);
            return Ok(());
        }

        if self.route_needs_replan() {
            if self.route.is_some() {
                info!("{} rerouting from {}", self.id, self.position);
            }
            self.plan(destination)?;
        }

        let Some(route) = &self.route else {
            return Ok(());
        };
        let (Some(edge), Some(next)) = (
            route.edges.get(self.route_index).copied(),
            route.nodes.get(self.route_index + 1).copied(),
        ) else {
            self.arrive(ctx);
            return Ok(());
        };

        if self.light_here().is_some() {
            self.request_passage(edge, next, ctx);
        } else {
            self.enter_edge(edge, next, ctx);
        }
        Ok(())
    }

    /// Move from the current node onto `edge`
    fn enter_edge(&mut self, edge: EdgeId, next: NodeId, ctx: &mut AgentContext) {
        if let Some(previous) = self.current_edge.take() {
            let _ = self.city.occupancy.exit(previous, &self.id);
        }
        let _ = self.city.occupancy.enter(edge, &self.id);
        self.current_edge = Some(edge);

        let travel = self.settings.seconds_per_cost * self.city.current_cost(edge);
        self.set_leg(Leg::OnEdge {
            edge,
            next,
            until: ctx.now + travel,
        });
    }

    fn arrive(&mut self, ctx: &mut AgentContext) {
        if let Some(edge) = self.current_edge.take() {
            let _ = self.city.occupancy.exit(edge, &self.id);
        }
        let elapsed = ctx.now - self.trip_started.take().unwrap_or(ctx.now);
        match self.role {
            VehicleRole::Normal => self.metrics.trip(self.id.as_str(), elapsed),
            VehicleRole::Emergency => self.metrics.ev_response(elapsed),
        }
        self.trips_completed += 1;
        self.route = None;
        self.route_index = 0;
        self.status = VehicleStatus::Arrived;
        info!(
            "{} reached {} after {:.1}s",
            self.id, self.position, elapsed
        );

        if self.settings.roaming {
            self.set_leg(Leg::Dwelling {
                until: ctx.now + self.settings.dwell_time,
            });
        } else {
            self.destination = None;
            self.set_leg(Leg::AtNode);
        }
    }

    /// Destination of the next trip after a dwell
    fn next_destination(&mut self) -> Option<NodeId> {
        let here = self.position;
        let candidates: Vec<NodeId> = match self.role {
            VehicleRole::Normal => {
                let nodes: Vec<NodeId> = self.city.graph.nodes().map(|n| n.id).collect();
                let far: Vec<NodeId> = nodes
                    .iter()
                    .copied()
                    .filter(|n| *n != here && n.manhattan(&here) >= MIN_TRIP_DISTANCE)
                    .collect();
                if far.is_empty() {
                    nodes.into_iter().filter(|n| *n != here).collect()
                } else {
                    far
                }
            }
            VehicleRole::Emergency => self
                .city
                .graph
                .hospitals()
                .iter()
                .copied()
                .filter(|h| *h != here)
                .collect(),
        };
        candidates.choose(&mut self.rng).copied()
    }

    fn backoff(&self, retry_after: f64) -> f64 {
        match self.role {
            VehicleRole::Normal => retry_after,
            VehicleRole::Emergency => retry_after.min(self.settings.emergency_backoff),
        }
    }

    fn handle_grant(&mut self, edge: EdgeId, from: AgentId, ctx: &mut AgentContext) {
        match self.leg {
            Leg::AwaitingGrant {
                edge: wanted, next, ..
            }
            | Leg::BackingOff {
                edge: wanted, next, ..
            } if wanted == edge =>
            {
                self.set_leg(Leg::Crossing {
                    edge,
                    next,
                    until: ctx.now + self.settings.crossing_time,
                });
            }
            Leg::Crossing { edge: held, .. } if held == edge => {}
            _ => {
                // Not waiting for this any more: hand it straight back.
                debug!("{} returns stale grant for {edge}", self.id);
                ctx.send(
                    from,
                    Message::PassageRelease {
                        vehicle_id: self.id.clone(),
                        edge,
                    },
                );
            }
        }
    }

    fn handle_deny(&mut self, edge: EdgeId, retry_after: f64, ctx: &mut AgentContext) {
        match self.leg {
            Leg::AwaitingGrant { edge: wanted, next, .. } | Leg::Crossing { edge: wanted, next, .. }
                if wanted == edge =>
            {
                if matches!(self.leg, Leg::Crossing { .. }) {
                    info!("{} preempted at {}", self.id, self.position);
                }
                self.set_leg(Leg::BackingOff {
                    edge,
                    next,
                    until: ctx.now + self.backoff(retry_after),
                });
            }
            _ => debug!("{} ignores deny for {edge}", self.id),
        }
    }

    /// Whether a road is still ahead of the vehicle
    fn is_ahead(&self, edge: EdgeId) -> bool {
        self.route
            .as_ref()
            .is_some_and(|route| route.edges.iter().skip(self.route_index).any(|e| *e == edge))
    }
}

impl Agent for VehicleAgent {
    fn id(&self) -> AgentId {
        self.agent_id()
    }

    fn on_message(&mut self, envelope: Envelope, ctx: &mut AgentContext) -> Result<(), SimError> {
        match envelope.message {
            Message::PassageGrant { vehicle_id, edge } if vehicle_id == self.id => {
                self.handle_grant(edge, envelope.from, ctx);
                Ok(())
            }
            Message::PassageDeny {
                vehicle_id,
                edge,
                retry_after,
            } if vehicle_id == self.id => {
                self.handle_deny(edge, retry_after, ctx);
                Ok(())
            }
            Message::IncidentReport { edge, .. } | Message::CongestionReport { edge, .. } => {
                if self.is_ahead(edge) {
                    self.reroute_pending = true;
                }
                Ok(())
            }
            other => Err(SimError::ProtocolViolation(format!(
                "{} got unexpected {} from {}",
                self.id,
                other.kind(),
                envelope.from
            ))),
        }
    }

    fn on_tick(&mut self, ctx: &mut AgentContext) -> Result<(), SimError> {
        match self.leg {
            Leg::AtNode => self.advance(ctx),
            Leg::AwaitingGrant { edge, next, .. } => {
                // No answer in time: the request may have been lost.
                self.request_passage(edge, next, ctx);
                Ok(())
            }
            Leg::BackingOff { edge, next, .. } => {
                if self.route_needs_replan() {
                    self.release_passage(edge, ctx);
                    self.set_leg(Leg::AtNode);
                    return self.advance(ctx);
                }
                self.request_passage(edge, next, ctx);
                Ok(())
            }
            Leg::Crossing { edge, next, .. } => {
                self.enter_edge(edge, next, ctx);
                self.release_passage(edge, ctx);
                Ok(())
            }
            Leg::OnEdge { next, .. } => {
                self.position = next;
                self.route_index += 1;
                self.set_leg(Leg::AtNode);
                self.advance(ctx)
            }
            Leg::Dwelling { .. } => {
                self.destination = self.next_destination();
                self.status = VehicleStatus::Idle;
                self.set_leg(Leg::AtNode);
                self.advance(ctx)
            }
        }
    }

    fn next_wake(&self) -> Option<SimTime> {
        match (self.leg, self.status) {
            (Leg::AtNode, VehicleStatus::Idle) if self.destination.is_some() => {
                Some(self.wake_at.unwrap_or(0.0))
            }
            _ => self.wake_at,
        }
    }

    fn on_stop(&mut self, ctx: &mut AgentContext) {
        match self.leg {
            Leg::AwaitingGrant { edge, .. }
            | Leg::BackingOff { edge, .. }
            | Leg::Crossing { edge, .. } => {
                self.release_passage(edge, ctx);
            }
            _ => {}
        }
        self.current_edge = None;
        self.city.occupancy.release_all(&self.id);
        if let Some(board) = &self.board {
            board.remove(&self.id);
        }
        self.leg = Leg::AtNode;
        self.wake_at = None;
    }

    fn is_finished(&self) -> bool {
        self.status == VehicleStatus::Arrived && matches!(self.leg, Leg::AtNode)
    }
}

/// A vehicle that drives to hospitals with the priority flag set
#[derive(Debug)]
pub struct EmergencyVehicleAgent(VehicleAgent);

impl EmergencyVehicleAgent {
    /// Creates an emergency vehicle heading for `hospital`
    pub fn new(
        id: VehicleId,
        start: NodeId,
        hospital: NodeId,
        city: Arc<City>,
        settings: VehicleSettings,
        seed: u64,
    ) -> Result<Self, SimError> {
        let is_hospital = city
            .graph
            .node(hospital)
            .is_some_and(|node| node.kind == NodeKind::Hospital);
        if !is_hospital {
            return Err(SimError::Configuration(format!(
                "emergency vehicle {id} must head for a hospital, {hospital} is not one"
            )));
        }
        let mut vehicle = VehicleAgent::new(id, start, hospital, city, settings, seed)?;
        vehicle.role = VehicleRole::Emergency;
        Ok(Self(vehicle))
    }

    /// Creates an emergency vehicle heading for the hospital nearest `start`
    pub fn to_nearest_hospital(
        id: VehicleId,
        start: NodeId,
        city: Arc<City>,
        settings: VehicleSettings,
        seed: u64,
    ) -> Result<Self, SimError> {
        let hospital = city.graph.nearest_hospital(start).ok_or_else(|| {
            SimError::Configuration("emergency vehicles need at least one hospital".to_string())
        })?;
        Self::new(id, start, hospital, city, settings, seed)
    }

    pub fn with_metrics(self, metrics: MetricsSink) -> Self {
        Self(self.0.with_metrics(metrics))
    }

    pub fn with_position_board(self, board: Arc<PositionBoard>) -> Self {
        Self(self.0.with_position_board(board))
    }

    pub fn vehicle(&self) -> &VehicleAgent {
        &self.0
    }
}

impl Agent for EmergencyVehicleAgent {
    fn id(&self) -> AgentId {
        self.0.id()
    }

    fn on_message(&mut self, envelope: Envelope, ctx: &mut AgentContext) -> Result<(), SimError> {
        self.0.on_message(envelope, ctx)
    }

    fn on_tick(&mut self, ctx: &mut AgentContext) -> Result<(), SimError> {
        self.0.on_tick(ctx)
    }

    fn next_wake(&self) -> Option<SimTime> {
        self.0.next_wake()
    }

    fn on_stop(&mut self, ctx: &mut AgentContext) {
        self.0.on_stop(ctx)
    }

    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}
