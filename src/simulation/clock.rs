//! Monotonic simulation clock

use tokio::time::{Duration, Instant};

use super::types::SimTime;

/// Stand-in for "never" when a wake time does not fit a `Duration`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Shared time source for agents and the maintenance loop.
///
/// Time is measured on tokio's clock, so a paused test runtime makes the
/// whole simulation run in virtual time.
#[derive(Debug, Clone, Copy)]
pub struct SimulationClock {
    start: Instant,
}

impl Default for SimulationClock {
    fn default() -> Self {
        Self::start()
    }
}

impl SimulationClock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Seconds elapsed since the clock started
    pub fn now(&self) -> SimTime {
        self.start.elapsed().as_secs_f64()
    }

    /// The tokio instant matching a simulation time.
    ///
    /// Times too large for a `Duration` saturate to a far-future instant.
    pub fn instant_at(&self, at: SimTime) -> Instant {
        let offset = Duration::try_from_secs_f64(at.max(0.0))
            .unwrap_or(FAR_FUTURE)
            .min(FAR_FUTURE);
        self.start + offset
    }
}
