//! Incident and roadblock registry
//!
//! Incidents reference edges by id only. Each edge has its own lock so that
//! reports and ticks from different agents interleave without a global lock.

use log::{debug, info};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::error::SimError;
use super::types::{
    EdgeId, IncidentId, SimTime, BLOCKED_THRESHOLD, ROADBLOCK_SEVERITY,
};

/// How severities of overlapping incidents on one edge combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeverityPolicy {
    /// Take the worst incident; overlapping reports cannot blow up the cost
    #[default]
    Max,
    /// Add all severities together
    Sum,
}

/// Lifecycle of an incident; purged incidents simply disappear
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IncidentState {
    Active,
    Expired,
}

/// An accident or roadblock on one edge
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub id: IncidentId,
    pub edge: EdgeId,
    pub severity: f64,
    pub created_at: SimTime,
    pub ttl: f64,
    pub state: IncidentState,
}

impl Incident {
    /// The time at which the incident stops counting
    pub fn expires_at(&self) -> SimTime {
        self.created_at + self.ttl
    }

    /// TTL left at the given time
    pub fn remaining_ttl(&self, now: SimTime) -> f64 {
        self.expires_at() - now
    }

    /// Whether the incident contributes cost at `at`
    pub fn is_active_at(&self, at: SimTime) -> bool {
        self.state == IncidentState::Active && self.remaining_ttl(at) > 0.0
    }
}

/// Registry of incidents keyed by edge
#[derive(Debug)]
pub struct EventManager {
    slots: Vec<Mutex<Vec<Incident>>>,
    next_id: AtomicU64,
    /// Manager time in seconds, stored as `f64` bits
    now_bits: AtomicU64,
}

impl EventManager {
    pub fn new(edge_count: usize) -> Self {
        Self {
            slots: (0..edge_count).map(|_| Mutex::new(Vec::new())).collect(),
            next_id: AtomicU64::new(0),
            now_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    fn slot(&self, edge: EdgeId) -> Result<&Mutex<Vec<Incident>>, SimError> {
        self.slots
            .get(edge.0)
            .ok_or_else(|| SimError::ProtocolViolation(format!("unknown edge {edge}")))
    }

    /// Time as seen by the manager, the sum of all ticks so far
    pub fn now(&self) -> SimTime {
        f64::from_bits(self.now_bits.load(Ordering::Acquire))
    }

    /// Register a new incident. Duplicates are never merged.
    pub fn report(&self, edge: EdgeId, severity: f64, ttl: f64) -> Result<IncidentId, SimError> {
        let slot = self.slot(edge)?;
        let id = IncidentId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let incident = Incident {
            id,
            edge,
            severity: severity.max(0.0),
            created_at: self.now(),
            ttl,
            state: if ttl > 0.0 {
                IncidentState::Active
            } else {
                IncidentState::Expired
            },
        };
        info!(
            "Incident {} on {} (severity {:.1}, ttl {:.1}s)",
            id.0, edge, incident.severity, ttl
        );
        lock(slot).push(incident);
        Ok(id)
    }

    /// Convenience: a very severe incident that blocks the edge for a while
    pub fn spawn_temporary_block(&self, edge: EdgeId, ttl: f64) -> Result<IncidentId, SimError> {
        self.report(edge, ROADBLOCK_SEVERITY, ttl)
    }

    /// Advance manager time and expire incidents whose TTL ran out.
    /// Returns the number of incidents that expired on this tick.
    pub fn tick(&self, elapsed: f64) -> usize {
        let step = elapsed.max(0.0);
        let previous = self
            .now_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + step).to_bits())
            })
            .unwrap_or_else(|bits| bits);
        let now = f64::from_bits(previous) + step;

        let mut expired = 0;
        for slot in &self.slots {
            for incident in lock(slot).iter_mut() {
                if incident.state == IncidentState::Active && incident.remaining_ttl(now) <= 0.0 {
                    incident.state = IncidentState::Expired;
                    expired += 1;
                    debug!("Incident {} on {} expired", incident.id.0, incident.edge);
                }
            }
        }
        expired
    }

    /// Purge expired incidents. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut purged = 0;
        for slot in &self.slots {
            let mut incidents = lock(slot);
            let before = incidents.len();
            incidents.retain(|inc| inc.state == IncidentState::Active);
            purged += before - incidents.len();
        }
        if purged > 0 {
            debug!("Purged {purged} expired incidents");
        }
        purged
    }

    /// Remove an incident before its TTL runs out
    pub fn clear(&self, id: IncidentId) -> bool {
        for slot in &self.slots {
            let mut incidents = lock(slot);
            if let Some(pos) = incidents.iter().position(|inc| inc.id == id) {
                incidents.remove(pos);
                return true;
            }
        }
        false
    }

    /// Active incidents on an edge, empty when there are none
    pub fn active_incidents(&self, edge: EdgeId) -> Vec<Incident> {
        let now = self.now();
        self.slot(edge)
            .map(|slot| {
                lock(slot)
                    .iter()
                    .filter(|inc| inc.is_active_at(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every active incident, ordered by id
    pub fn all_active(&self) -> Vec<Incident> {
        let now = self.now();
        let mut all: Vec<Incident> = self
            .slots
            .iter()
            .flat_map(|slot| {
                lock(slot)
                    .iter()
                    .filter(|inc| inc.is_active_at(now))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        all.sort_by_key(|inc| inc.id);
        all
    }

    /// Combined severity of the incidents active on `edge` at `at`.
    ///
    /// # Panics
    /// Panics on an unknown edge; callers only pass ids taken from the graph.
    pub fn penalty(&self, edge: EdgeId, at: SimTime, policy: SeverityPolicy) -> f64 {
        let incidents = lock(&self.slots[edge.0]);
        let active = incidents.iter().filter(|inc| inc.is_active_at(at));
        match policy {
            SeverityPolicy::Max => active.map(|inc| inc.severity).fold(0.0, f64::max),
            SeverityPolicy::Sum => active.map(|inc| inc.severity).sum(),
        }
    }

    /// Whether the worst active incident on the edge reaches `threshold`
    pub fn is_blocked_above(&self, edge: EdgeId, threshold: f64) -> bool {
        self.active_incidents(edge)
            .iter()
            .any(|inc| inc.severity >= threshold)
    }

    /// Whether the edge carries a roadblock-grade incident
    pub fn is_blocked(&self, edge: EdgeId) -> bool {
        self.is_blocked_above(edge, BLOCKED_THRESHOLD)
    }

    /// Edges carrying a roadblock-grade incident
    pub fn blocked_edges(&self) -> Vec<EdgeId> {
        let mut edges: Vec<EdgeId> = self
            .all_active()
            .into_iter()
            .filter(|inc| inc.severity >= BLOCKED_THRESHOLD)
            .map(|inc| inc.edge)
            .collect();
        edges.sort();
        edges.dedup();
        edges
    }

    pub fn edge_count(&self) -> usize {
        self.slots.len()
    }
}

/// Lock a per-edge slot, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
