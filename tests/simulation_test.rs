//! End-to-end runs of the agent runtime on tokio's paused clock

use smart_traffic::simulation::{
    render_map, AgentId, ChannelTransport, CitySnapshot, Envelope, MetricKind, MetricRecord,
    MetricsSummary, Message, NodeId, PositionBoard, SimConfig, SimWorld, SimulationClock,
    Transport, VehicleId, VehicleStatus,
};
use std::time::Duration;

fn quiet_config(width: u32, height: u32) -> SimConfig {
    SimConfig {
        vehicle_count: 2,
        emergency_count: 1,
        roaming: false,
        incident_probability: 0.0,
        seed: Some(7),
        ..SimConfig::small(width, height)
    }
}

/// Non-roaming vehicles all reach their destinations and report metrics
#[tokio::test(start_paused = true)]
async fn test_vehicles_complete_their_trips() {
    let mut world = SimWorld::start(quiet_config(4, 4)).unwrap();
    world.run_for(Duration::from_secs(60)).await.unwrap();
    let report = world.shutdown().await;

    assert_eq!(report.seed, 7);
    assert_eq!(report.vehicles.len(), 3);
    for vehicle in &report.vehicles {
        assert_eq!(vehicle.status, VehicleStatus::Arrived, "{} did not arrive", vehicle.id);
        assert_eq!(vehicle.trips_completed, 1);
    }
    assert_eq!(report.summary.trips_completed, 2);
    assert_eq!(report.summary.ev_responses, 1);
    assert!(report.summary.avg_rho.is_some());
    assert_eq!(report.incidents_reported, 0);
}

#[tokio::test(start_paused = true)]
async fn test_occupancy_is_released_after_shutdown() {
    let mut config = quiet_config(5, 5);
    config.vehicle_count = 6;
    config.roaming = true;
    let mut world = SimWorld::start(config).unwrap();
    world.run_for(Duration::from_secs(5)).await.unwrap();
    let city = world.city().clone();
    let board = world.positions().clone();
    let report = world.shutdown().await;

    assert_eq!(report.vehicles.len(), 7);
    for road in city.graph.edges() {
        assert_eq!(city.occupancy.count(road.id), 0);
    }
    assert!(board.all().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reporter_feeds_incidents_into_the_city() {
    let config = SimConfig {
        incident_probability: 1.0,
        incident_interval: 1.0,
        incident_ttl: 100.0,
        max_incidents_per_round: 2,
        seed: Some(11),
        ..SimConfig::small(4, 4)
    };
    let mut world = SimWorld::start(config).unwrap();
    world.run_for(Duration::from_millis(3500)).await.unwrap();
    let active = world.city().events.all_active().len();
    let report = world.shutdown().await;

    assert!(report.incidents_reported >= 3);
    assert_eq!(active, report.incidents_reported);
    assert_eq!(report.snapshot.incidents.len(), active);
}

#[tokio::test(start_paused = true)]
async fn test_incident_desk_applies_reports() {
    let mut world = SimWorld::start(SimConfig {
        incident_probability: 0.0,
        ..SimConfig::small(3, 3)
    })
    .unwrap();
    let edge = world.city().graph.edge_between(NodeId::new(0, 0), NodeId::new(1, 0)).unwrap();
    world
        .transport()
        .send(Envelope::new(
            AgentId::IncidentReporter,
            AgentId::IncidentDesk,
            Message::IncidentReport {
                edge,
                severity: 10.0,
                ttl: 30.0,
            },
        ))
        .unwrap();
    world.run_for(Duration::from_secs(1)).await.unwrap();

    assert!(world.city().events.is_blocked(edge));
    assert!(world.snapshot().edges[edge.0].cost > 10.0);
    world.shutdown().await;
}

/// The maintenance loop tells vehicles once when a road fills up
#[tokio::test(start_paused = true)]
async fn test_congestion_is_broadcast_on_upward_crossing() {
    let config = SimConfig {
        incident_probability: 0.0,
        ema_alpha: 0.9,
        congestion_threshold: 0.5,
        ..SimConfig::small(3, 3)
    };
    let capacity = config.default_capacity;
    let interval = config.sample_interval;
    let mut world = SimWorld::start(config).unwrap();
    let mut watcher = world
        .transport()
        .register(AgentId::vehicle(&VehicleId::new("watcher")));

    let edge = world.city().graph.edge_between(NodeId::new(0, 1), NodeId::new(1, 1)).unwrap();
    for i in 0..capacity {
        world
            .city()
            .occupancy
            .enter(edge, &VehicleId::new(format!("parked_{i}")))
            .unwrap();
    }
    world.run_for(Duration::from_secs_f64(interval * 1.2)).await.unwrap();

    let envelope = watcher.try_recv().expect("a congestion report");
    assert_eq!(envelope.from, AgentId::IncidentDesk);
    match envelope.message {
        Message::CongestionReport {
            edge: reported,
            observed_density,
        } => {
            assert_eq!(reported, edge);
            assert!((observed_density - 0.9).abs() < 1e-9);
        }
        other => panic!("expected a congestion report, got {other:?}"),
    }
    assert!(watcher.try_recv().is_none());

    // Staying congested is not news
    world.run_for(Duration::from_secs_f64(interval * 3.0)).await.unwrap();
    assert!(watcher.try_recv().is_none());
    world.shutdown().await;
}

/// Wake times that do not fit a Duration saturate instead of panicking
#[tokio::test(start_paused = true)]
async fn test_clock_saturates_unreachable_times() {
    let clock = SimulationClock::start();
    let hour = clock.instant_at(3600.0);
    assert!(clock.instant_at(f64::INFINITY) > hour);
    assert_eq!(clock.instant_at(f64::INFINITY), clock.instant_at(1e300));
    assert_eq!(clock.instant_at(-5.0), clock.instant_at(0.0));
}

#[test]
fn test_send_to_unknown_recipient_fails() {
    let transport = ChannelTransport::new();
    let _mailbox = transport.register(AgentId::IncidentDesk);
    let result = transport.send(Envelope::new(
        AgentId::IncidentDesk,
        AgentId::vehicle(&VehicleId::new("nobody")),
        Message::PassageRelease {
            vehicle_id: VehicleId::new("nobody"),
            edge: smart_traffic::simulation::EdgeId(0),
        },
    ));
    assert!(result.is_err());
}

#[tokio::test]
async fn test_broadcast_reaches_vehicles_only() {
    let transport = ChannelTransport::new();
    let mut car = transport.register(AgentId::vehicle(&VehicleId::new("a")));
    let mut ev = transport.register(AgentId::vehicle(&VehicleId::new("b")));
    let mut light = transport.register(AgentId::TrafficLight(NodeId::new(0, 0)));

    let message = Message::CongestionReport {
        edge: smart_traffic::simulation::EdgeId(3),
        observed_density: 0.9,
    };
    assert_eq!(transport.broadcast_to_vehicles(&AgentId::IncidentDesk, &message), 2);
    assert_eq!(car.recv().await.unwrap().message, message);
    assert_eq!(ev.recv().await.unwrap().message, message);
    assert!(light.try_recv().is_none());
}

#[test]
fn test_summary_from_records() {
    let record = |kind, id: &str, value| MetricRecord {
        kind,
        id: id.to_string(),
        value,
    };
    let records = vec![
        record(MetricKind::Trip, "vehicle_0", 10.0),
        record(MetricKind::Rho, "-", 0.2),
        record(MetricKind::EvResponse, "EV", 4.0),
        record(MetricKind::Trip, "vehicle_1", 20.0),
        record(MetricKind::EvResponse, "EV", 6.0),
        record(MetricKind::Rho, "-", 0.4),
    ];
    let summary = MetricsSummary::from_records(&records);
    assert_eq!(summary.trips_completed, 2);
    assert_eq!(summary.avg_trip_time, Some(15.0));
    assert_eq!(summary.ev_responses, 2);
    assert_eq!(summary.avg_ev_response, Some(5.0));
    assert_eq!(summary.last_ev_response, Some(6.0));
    assert!((summary.avg_rho.unwrap() - 0.3).abs() < 1e-9);

    let json = serde_json::to_string(&records[2]).unwrap();
    assert_eq!(json, r#"{"type":"ev_response","id":"EV","value":4.0}"#);
    assert_eq!(MetricsSummary::from_records(&[]).avg_trip_time, None);
}

#[test]
fn test_map_and_snapshot() {
    let config = SimConfig {
        hospitals: Some(vec![NodeId::new(1, 1)]),
        ..SimConfig::small(3, 3)
    };
    let city = smart_traffic::simulation::City::from_config(&config).unwrap();
    let blocked = city.graph.edge_between(NodeId::new(0, 2), NodeId::new(1, 2)).unwrap();
    city.events.spawn_temporary_block(blocked, 5.0).unwrap();
    let board = PositionBoard::new();

    let map = render_map(&city, &board, config.congestion_threshold);
    let lines: Vec<&str> = map.lines().skip(1).collect();
    assert_eq!(lines, vec!["L-+-L", "| | |", "+-H-+", "| | |", "L#+-L"]);

    let snapshot = CitySnapshot::capture(&city, &board);
    assert_eq!(snapshot.nodes.len(), 9);
    assert_eq!(snapshot.edges.len(), 12);
    assert_eq!(snapshot.incidents.len(), 1);
    let json = snapshot.to_json().unwrap();
    assert!(json.contains("\"incidents\""));
}
