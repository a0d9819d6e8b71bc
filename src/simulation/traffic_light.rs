//! Traffic light arbitration
//!
//! Every road touching a controlled node crosses every other one inside the
//! intersection, so the light holds at most one grant at a time.

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

use super::agent::{Agent, AgentContext};
use super::city::City;
use super::error::SimError;
use super::protocol::{Envelope, Message};
use super::types::{AgentId, EdgeId, NodeId, SimTime, VehicleId};

/// Arbitration state of a light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LightState {
    Idle,
    Evaluating,
}

/// A queued passage request
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub vehicle: VehicleId,
    pub edge: EdgeId,
    pub priority: bool,
    /// Arbitration cycle in which the vehicle first asked
    pub batch: u64,
}

impl PendingRequest {
    /// Emergencies first, then arrival cycle, then vehicle id
    fn sort_key(&self) -> (bool, u64, &VehicleId) {
        (!self.priority, self.batch, &self.vehicle)
    }
}

/// The passage currently granted by a light
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub request: PendingRequest,
    pub since: SimTime,
}

/// Outcome of arbitration for one vehicle
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Grant {
        vehicle: VehicleId,
        edge: EdgeId,
    },
    Deny {
        vehicle: VehicleId,
        edge: EdgeId,
        retry_after: f64,
    },
}

impl Decision {
    pub fn vehicle(&self) -> &VehicleId {
        match self {
            Decision::Grant { vehicle, .. } | Decision::Deny { vehicle, .. } => vehicle,
        }
    }

    fn into_message(self) -> Message {
        match self {
            Decision::Grant { vehicle, edge } => Message::PassageGrant {
                vehicle_id: vehicle,
                edge,
            },
            Decision::Deny {
                vehicle,
                edge,
                retry_after,
            } => Message::PassageDeny {
                vehicle_id: vehicle,
                edge,
                retry_after,
            },
        }
    }
}

/// Per-node arbiter over the roads leaving a controlled intersection
#[derive(Debug, Clone)]
pub struct TrafficLight {
    pub node: NodeId,
    controlled_edges: Vec<EdgeId>,
    queue: Vec<PendingRequest>,
    grant: Option<Grant>,
    state: LightState,
    /// Vehicles that asked during the current cycle
    asked_this_cycle: Vec<VehicleId>,
    /// Holder re-asked for its grant, which may have been lost
    regrant: bool,
    /// Controlled roads currently closed by an incident
    blocked: Vec<EdgeId>,
    retry_after: f64,
    max_grant_hold: f64,
}

impl TrafficLight {
    pub fn new(
        node: NodeId,
        controlled_edges: Vec<EdgeId>,
        retry_after: f64,
        max_grant_hold: f64,
    ) -> Self {
        Self {
            node,
            controlled_edges,
            queue: Vec::new(),
            grant: None,
            state: LightState::Idle,
            asked_this_cycle: Vec::new(),
            regrant: false,
            blocked: Vec::new(),
            retry_after,
            max_grant_hold,
        }
    }

    pub fn state(&self) -> LightState {
        self.state
    }

    pub fn current_grant(&self) -> Option<&Grant> {
        self.grant.as_ref()
    }

    /// Vehicle holding the grant, if any
    pub fn granted_vehicle(&self) -> Option<&VehicleId> {
        self.grant.as_ref().map(|g| &g.request.vehicle)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Requests waiting to enter one particular road
    pub fn queued_on(&self, edge: EdgeId) -> usize {
        self.queue.iter().filter(|r| r.edge == edge).count()
    }

    pub fn controls(&self, edge: EdgeId) -> bool {
        self.controlled_edges.contains(&edge)
    }

    /// Refresh which controlled roads are closed. Requests for a closed
    /// road are denied until it reopens.
    pub fn update_blocked(&mut self, is_blocked: impl Fn(EdgeId) -> bool) {
        self.blocked = self
            .controlled_edges
            .iter()
            .copied()
            .filter(|edge| is_blocked(*edge))
            .collect();
    }

    pub fn is_blocked(&self, edge: EdgeId) -> bool {
        self.blocked.contains(&edge)
    }

    /// Best queued request that may be granted right now
    fn next_eligible(&self) -> Option<usize> {
        self.queue.iter().position(|r| !self.is_blocked(r.edge))
    }

    /// Record a passage request for the next arbitration.
    ///
    /// A vehicle asking again keeps its place in line.
    pub fn submit(
        &mut self,
        vehicle: VehicleId,
        edge: EdgeId,
        priority: bool,
        batch: u64,
    ) -> Result<(), SimError> {
        if !self.controls(edge) {
            return Err(SimError::ProtocolViolation(format!(
                "{vehicle} asked light at {} for {edge}, which it does not control",
                self.node
            )));
        }
        self.state = LightState::Evaluating;
        if !self.asked_this_cycle.contains(&vehicle) {
            self.asked_this_cycle.push(vehicle.clone());
        }

        if let Some(grant) = self.grant.as_mut() {
            if grant.request.vehicle == vehicle {
                grant.request.edge = edge;
                self.regrant = true;
                return Ok(());
            }
        }
        match self.queue.iter_mut().find(|r| r.vehicle == vehicle) {
            Some(existing) => {
                existing.edge = edge;
                existing.priority |= priority;
            }
            None => self.queue.push(PendingRequest {
                vehicle,
                edge,
                priority,
                batch,
            }),
        }
        Ok(())
    }

    /// A vehicle cleared the intersection or withdrew its request
    pub fn release(&mut self, vehicle: &VehicleId, edge: EdgeId) -> Result<(), SimError> {
        if self.granted_vehicle() == Some(vehicle) {
            debug!("Light {} released by {vehicle}", self.node);
            self.grant = None;
            self.regrant = false;
            return Ok(());
        }
        if let Some(pos) = self.queue.iter().position(|r| &r.vehicle == vehicle) {
            self.queue.remove(pos);
            return Ok(());
        }
        Err(SimError::ProtocolViolation(format!(
            "{vehicle} released {edge} at light {} without holding or requesting it",
            self.node
        )))
    }

    /// Run one arbitration cycle: grant at most one request, deny the rest
    /// of this cycle's askers.
    pub fn arbitrate(&mut self, now: SimTime) -> Vec<Decision> {
        let mut decisions = Vec::new();
        self.queue.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let head_is_emergency = self.next_eligible().is_some_and(|i| self.queue[i].priority);
        let holder_is_normal = self.grant.as_ref().is_some_and(|g| !g.request.priority);

        if self.grant.is_some() && head_is_emergency && holder_is_normal {
            if let Some(preempted) = self.grant.take() {
                info!(
                    "Light {}: emergency preempts {}",
                    self.node, preempted.request.vehicle
                );
                decisions.push(Decision::Deny {
                    vehicle: preempted.request.vehicle.clone(),
                    edge: preempted.request.edge,
                    retry_after: self.retry_after,
                });
                self.queue.push(preempted.request);
                self.queue.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
                self.regrant = false;
            }
        }

        if self.regrant && self.grant.as_ref().is_some_and(|g| self.is_blocked(g.request.edge)) {
            if let Some(closed) = self.grant.take() {
                debug!(
                    "Light {}: {} closed, withdrawing grant of {}",
                    self.node, closed.request.edge, closed.request.vehicle
                );
                decisions.push(Decision::Deny {
                    vehicle: closed.request.vehicle,
                    edge: closed.request.edge,
                    retry_after: self.retry_after,
                });
            }
            self.regrant = false;
        }

        let eligible = if self.grant.is_none() { self.next_eligible() } else { None };
        if let Some(index) = eligible {
            let request = self.queue.remove(index);
            decisions.push(Decision::Grant {
                vehicle: request.vehicle.clone(),
                edge: request.edge,
            });
            self.grant = Some(Grant {
                request,
                since: now,
            });
            self.regrant = false;
        } else if self.regrant {
            if let Some(grant) = &self.grant {
                decisions.push(Decision::Grant {
                    vehicle: grant.request.vehicle.clone(),
                    edge: grant.request.edge,
                });
            }
            self.regrant = false;
        }

        for request in &self.queue {
            let already_told = decisions.iter().any(|d| d.vehicle() == &request.vehicle);
            if self.asked_this_cycle.contains(&request.vehicle) && !already_told {
                if self.is_blocked(request.edge) {
                    debug!(
                        "Light {}: {} refused {}, blocked by incident",
                        self.node, request.vehicle, request.edge
                    );
                }
                decisions.push(Decision::Deny {
                    vehicle: request.vehicle.clone(),
                    edge: request.edge,
                    retry_after: self.retry_after,
                });
            }
        }

        self.asked_this_cycle.clear();
        self.state = LightState::Idle;
        decisions
    }

    /// When the current grant will be considered abandoned
    pub fn grant_deadline(&self) -> Option<SimTime> {
        self.grant.as_ref().map(|g| g.since + self.max_grant_hold)
    }

    /// Revoke a grant that was held too long, then hand the light on
    pub fn expire_grant(&mut self, now: SimTime) -> Vec<Decision> {
        let Some(deadline) = self.grant_deadline() else {
            return Vec::new();
        };
        if now < deadline {
            return Vec::new();
        }
        let mut decisions = Vec::new();
        if let Some(stale) = self.grant.take() {
            warn!(
                "Light {}: revoking grant held by {} for {:.1}s",
                self.node,
                stale.request.vehicle,
                now - stale.since
            );
            decisions.push(Decision::Deny {
                vehicle: stale.request.vehicle,
                edge: stale.request.edge,
                retry_after: self.retry_after,
            });
        }
        decisions.extend(self.arbitrate(now));
        decisions
    }
}

/// Agent wrapper feeding transport messages through a [`TrafficLight`]
#[derive(Debug)]
pub struct TrafficLightAgent {
    light: TrafficLight,
    batch: u64,
    /// Source of road closures; without it no road counts as blocked
    city: Option<Arc<City>>,
}

impl TrafficLightAgent {
    pub fn new(light: TrafficLight) -> Self {
        Self {
            light,
            batch: 0,
            city: None,
        }
    }

    pub fn with_city(mut self, city: Arc<City>) -> Self {
        self.city = Some(city);
        self
    }

    pub fn light(&self) -> &TrafficLight {
        &self.light
    }

    fn refresh_blocked(&mut self) {
        if let Some(city) = &self.city {
            self.light.update_blocked(|edge| city.events.is_blocked(edge));
        }
    }

    fn send_decisions(&self, decisions: Vec<Decision>, ctx: &mut AgentContext) {
        for decision in decisions {
            let to = AgentId::vehicle(decision.vehicle());
            ctx.send(to, decision.into_message());
        }
    }
}

impl Agent for TrafficLightAgent {
    fn id(&self) -> AgentId {
        AgentId::TrafficLight(self.light.node)
    }

    fn on_message(&mut self, envelope: Envelope, ctx: &mut AgentContext) -> Result<(), SimError> {
        self.on_batch(vec![envelope], ctx)
    }

    /// Messages that arrived together are one arbitration cycle
    fn on_batch(
        &mut self,
        envelopes: Vec<Envelope>,
        ctx: &mut AgentContext,
    ) -> Result<(), SimError> {
        self.batch += 1;
        for envelope in envelopes {
            let outcome = match envelope.message {
                Message::PassageRequest {
                    vehicle_id,
                    edge,
                    priority,
                } => self.light.submit(vehicle_id, edge, priority, self.batch),
                Message::PassageRelease { vehicle_id, edge } => {
                    self.light.release(&vehicle_id, edge)
                }
                other => Err(SimError::ProtocolViolation(format!(
                    "light at {} cannot handle {}",
                    self.light.node,
                    other.kind()
                ))),
            };
            if let Err(e) = outcome {
                warn!("{e}");
            }
        }
        self.refresh_blocked();
        let decisions = self.light.arbitrate(ctx.now);
        self.send_decisions(decisions, ctx);
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut AgentContext) -> Result<(), SimError> {
        self.refresh_blocked();
        let decisions = self.light.expire_grant(ctx.now);
        self.send_decisions(decisions, ctx);
        Ok(())
    }

    fn next_wake(&self) -> Option<SimTime> {
        self.light.grant_deadline()
    }
}
