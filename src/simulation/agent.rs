//! Agent capability interface and the task that drives an agent
//!
//! Agents are plain state machines: they react to messages and to their own
//! wake-up times and leave outgoing envelopes in an [`AgentContext`]. The
//! runner owns all the async plumbing.

use log::{debug, error, warn};
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, watch};
use tokio::time::sleep_until;

use super::clock::SimulationClock;
use super::error::SimError;
use super::protocol::{Envelope, Message};
use super::reporter::IncidentReporterAgent;
use super::traffic_light::TrafficLightAgent;
use super::transport::{Mailbox, Transport};
use super::types::{AgentId, SimTime};
use super::vehicle::{EmergencyVehicleAgent, VehicleAgent};

/// Per-step view an agent gets of the world: the time, and an outbox
#[derive(Debug)]
pub struct AgentContext {
    pub now: SimTime,
    from: AgentId,
    outbox: Vec<Envelope>,
}

impl AgentContext {
    pub fn new(from: AgentId, now: SimTime) -> Self {
        Self {
            now,
            from,
            outbox: Vec::new(),
        }
    }

    pub fn send(&mut self, to: AgentId, message: Message) {
        self.outbox
            .push(Envelope::new(self.from.clone(), to, message));
    }

    pub fn take_outbox(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }
}

/// Capabilities shared by every agent kind
pub trait Agent: Send {
    fn id(&self) -> AgentId;

    fn on_message(&mut self, envelope: Envelope, ctx: &mut AgentContext) -> Result<(), SimError>;

    /// Messages that were already waiting together
    fn on_batch(
        &mut self,
        envelopes: Vec<Envelope>,
        ctx: &mut AgentContext,
    ) -> Result<(), SimError> {
        for envelope in envelopes {
            self.on_message(envelope, ctx)?;
        }
        Ok(())
    }

    /// Called once the time returned by [`Agent::next_wake`] is reached
    fn on_tick(&mut self, ctx: &mut AgentContext) -> Result<(), SimError>;

    /// When the agent next wants [`Agent::on_tick`], if ever
    fn next_wake(&self) -> Option<SimTime>;

    /// Last chance to withdraw outstanding state before the task ends
    fn on_stop(&mut self, _ctx: &mut AgentContext) {}

    fn is_finished(&self) -> bool {
        false
    }
}

/// The closed set of agents in the simulation
#[derive(Debug)]
pub enum SimAgent {
    Vehicle(VehicleAgent),
    EmergencyVehicle(EmergencyVehicleAgent),
    TrafficLight(TrafficLightAgent),
    IncidentReporter(IncidentReporterAgent),
}

impl SimAgent {
    fn inner(&self) -> &dyn Agent {
        match self {
            SimAgent::Vehicle(a) => a,
            SimAgent::EmergencyVehicle(a) => a,
            SimAgent::TrafficLight(a) => a,
            SimAgent::IncidentReporter(a) => a,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Agent {
        match self {
            SimAgent::Vehicle(a) => a,
            SimAgent::EmergencyVehicle(a) => a,
            SimAgent::TrafficLight(a) => a,
            SimAgent::IncidentReporter(a) => a,
        }
    }
}

impl Agent for SimAgent {
    fn id(&self) -> AgentId {
        self.inner().id()
    }

    fn on_message(&mut self, envelope: Envelope, ctx: &mut AgentContext) -> Result<(), SimError> {
        self.inner_mut().on_message(envelope, ctx)
    }

    fn on_batch(
        &mut self,
        envelopes: Vec<Envelope>,
        ctx: &mut AgentContext,
    ) -> Result<(), SimError> {
        self.inner_mut().on_batch(envelopes, ctx)
    }

    fn on_tick(&mut self, ctx: &mut AgentContext) -> Result<(), SimError> {
        self.inner_mut().on_tick(ctx)
    }

    fn next_wake(&self) -> Option<SimTime> {
        self.inner().next_wake()
    }

    fn on_stop(&mut self, ctx: &mut AgentContext) {
        self.inner_mut().on_stop(ctx)
    }

    fn is_finished(&self) -> bool {
        self.inner().is_finished()
    }
}

/// Everything an agent task needs besides the agent itself
#[derive(Clone)]
pub struct AgentRuntime {
    pub transport: Arc<dyn Transport>,
    pub clock: SimulationClock,
    pub shutdown: watch::Receiver<bool>,
    /// Fatal errors are reported here so the simulation can stop
    pub fatal: UnboundedSender<SimError>,
}

fn deliver(transport: &dyn Transport, ctx: &mut AgentContext) {
    for envelope in ctx.take_outbox() {
        if let Err(e) = transport.send(envelope) {
            warn!("{e}");
        }
    }
}

/// Drives one agent until shutdown, until it finishes, or until it hits a
/// fatal error.
pub async fn run_agent<A: Agent>(mut agent: A, mut mailbox: Mailbox, runtime: AgentRuntime) -> A {
    let AgentRuntime {
        transport,
        clock,
        mut shutdown,
        fatal,
    } = runtime;
    let id = agent.id();

    loop {
        if agent.is_finished() || *shutdown.borrow() {
            break;
        }

        let wake = agent.next_wake();
        let wake_timer = async {
            match wake {
                Some(at) => sleep_until(clock.instant_at(at)).await,
                None => std::future::pending::<()>().await,
            }
        };

        let mut ctx = AgentContext::new(id.clone(), clock.now());
        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            envelope = mailbox.recv() => match envelope {
                Some(first) => {
                    let mut batch = vec![first];
                    batch.extend(mailbox.drain());
                    ctx.now = clock.now();
                    agent.on_batch(batch, &mut ctx)
                }
                None => break,
            },
            _ = wake_timer => {
                ctx.now = clock.now();
                agent.on_tick(&mut ctx)
            }
        };
        deliver(transport.as_ref(), &mut ctx);

        if let Err(e) = outcome {
            if e.is_fatal() {
                error!("{id}: {e}");
                let _ = fatal.send(e);
                break;
            }
            warn!("{id}: {e}");
        }
    }

    // Peers may already be gone at shutdown.
    let mut ctx = AgentContext::new(id, clock.now());
    agent.on_stop(&mut ctx);
    for envelope in ctx.take_outbox() {
        if let Err(e) = transport.send(envelope) {
            debug!("{e}");
        }
    }
    agent
}
