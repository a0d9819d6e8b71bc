//! Metric record stream
//!
//! The core only produces records; formatting and persistence belong to
//! whoever drains the stream.

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Class of a metric record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Completed trip of an ordinary vehicle
    Trip,
    /// Completed run of an emergency vehicle
    EvResponse,
    /// Periodic average congestion snapshot
    Rho,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub id: String,
    pub value: f64,
}

/// Producer handle, cheap to clone into every agent
#[derive(Debug, Clone, Default)]
pub struct MetricsSink {
    sender: Option<UnboundedSender<MetricRecord>>,
}

impl MetricsSink {
    /// A sink and the stream it feeds
    pub fn channel() -> (Self, UnboundedReceiver<MetricRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: MetricKind, id: impl Into<String>, value: f64) {
        if let Some(sender) = &self.sender {
            // A dropped receiver just means nobody is listening any more.
            let _ = sender.send(MetricRecord {
                kind,
                id: id.into(),
                value,
            });
        }
    }

    pub fn trip(&self, vehicle: &str, elapsed: f64) {
        self.record(MetricKind::Trip, vehicle, elapsed);
    }

    pub fn ev_response(&self, elapsed: f64) {
        self.record(MetricKind::EvResponse, "EV", elapsed);
    }

    pub fn rho(&self, average_density: f64) {
        self.record(MetricKind::Rho, "-", average_density);
    }
}

/// Aggregates over a record stream
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub trips_completed: usize,
    pub avg_trip_time: Option<f64>,
    pub ev_responses: usize,
    pub avg_ev_response: Option<f64>,
    pub last_ev_response: Option<f64>,
    pub avg_rho: Option<f64>,
}

impl MetricsSummary {
    pub fn from_records(records: &[MetricRecord]) -> Self {
        let values = |kind: MetricKind| -> Vec<f64> {
            records
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| r.value)
                .collect()
        };
        let mean = |v: &[f64]| {
            if v.is_empty() {
                None
            } else {
                Some(v.iter().sum::<f64>() / v.len() as f64)
            }
        };

        let trips = values(MetricKind::Trip);
        let evs = values(MetricKind::EvResponse);
        let rho = values(MetricKind::Rho);
        Self {
            trips_completed: trips.len(),
            avg_trip_time: mean(&trips),
            ev_responses: evs.len(),
            avg_ev_response: mean(&evs),
            last_ev_response: evs.last().copied(),
            avg_rho: mean(&rho),
        }
    }
}

/// Takes every record currently buffered in the stream
pub fn drain_records(receiver: &mut UnboundedReceiver<MetricRecord>) -> Vec<MetricRecord> {
    std::iter::from_fn(|| receiver.try_recv().ok()).collect()
}
