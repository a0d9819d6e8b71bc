//! Message transport between agents
//!
//! The core only needs addressed, asynchronous, at-most-once delivery with
//! FIFO order per sender/receiver pair. `ChannelTransport` provides that
//! in-process with one unbounded tokio channel per mailbox.

use log::{debug, trace};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use super::error::SimError;
use super::protocol::{Envelope, Message};
use super::types::AgentId;

/// Delivery side of the transport boundary
pub trait Transport: Send + Sync {
    /// Queue an envelope for its recipient
    fn send(&self, envelope: Envelope) -> Result<(), SimError>;

    /// Send a copy of `message` to every registered vehicle
    fn broadcast_to_vehicles(&self, from: &AgentId, message: &Message) -> usize;
}

/// Receive side of a registered endpoint
#[derive(Debug)]
pub struct Mailbox {
    id: AgentId,
    receiver: UnboundedReceiver<Envelope>,
}

impl Mailbox {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Waits for the next envelope; `None` once the transport is gone
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Takes an envelope if one is already waiting
    pub fn try_recv(&mut self) -> Option<Envelope> {
        match self.receiver.try_recv() {
            Ok(envelope) => Some(envelope),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Everything already waiting, in arrival order
    pub fn drain(&mut self) -> Vec<Envelope> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// In-process transport with a channel per endpoint
#[derive(Debug, Default)]
pub struct ChannelTransport {
    endpoints: RwLock<HashMap<AgentId, UnboundedSender<Envelope>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a mailbox for `id`, replacing any previous one
    pub fn register(&self, id: AgentId) -> Mailbox {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone(), sender);
        Mailbox { id, receiver }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, envelope: Envelope) -> Result<(), SimError> {
        let endpoints = self
            .endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = endpoints.get(&envelope.to) else {
            return Err(SimError::ProtocolViolation(format!(
                "{} sent {} to unknown recipient {}",
                envelope.from,
                envelope.message.kind(),
                envelope.to
            )));
        };
        trace!("{} -> {}: {:?}", envelope.from, envelope.to, envelope.message);
        let to = envelope.to.clone();
        sender.send(envelope).map_err(|_| {
            SimError::ProtocolViolation(format!("mailbox of {to} is closed"))
        })
    }

    fn broadcast_to_vehicles(&self, from: &AgentId, message: &Message) -> usize {
        let endpoints = self
            .endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut delivered = 0;
        for (id, sender) in endpoints.iter().filter(|(id, _)| id.is_vehicle()) {
            let envelope = Envelope::new(from.clone(), id.clone(), message.clone());
            match sender.send(envelope) {
                Ok(()) => delivered += 1,
                Err(_) => debug!("Dropping broadcast to finished agent {id}"),
            }
        }
        delivered
    }
}
