//! Incident registry tests

use smart_traffic::simulation::{
    EdgeId, EventManager, IncidentState, SeverityPolicy, SimError, BLOCKED_THRESHOLD,
};

#[test]
fn test_report_and_penalty() {
    let events = EventManager::new(4);
    let id = events.report(EdgeId(1), 2.0, 5.0).unwrap();

    assert_eq!(events.active_incidents(EdgeId(1)).len(), 1);
    assert_eq!(events.active_incidents(EdgeId(1))[0].id, id);
    assert_eq!(events.penalty(EdgeId(1), 0.0, SeverityPolicy::Max), 2.0);
    assert_eq!(events.penalty(EdgeId(0), 0.0, SeverityPolicy::Max), 0.0);
}

#[test]
fn test_report_on_unknown_edge_is_rejected() {
    let events = EventManager::new(2);
    let err = events.report(EdgeId(7), 1.0, 1.0).unwrap_err();
    assert!(matches!(err, SimError::ProtocolViolation(_)));
    assert!(events.all_active().is_empty());
}

/// Once the TTL runs out the incident stops counting, at that time and later
#[test]
fn test_expired_incident_excluded_from_cost() {
    let events = EventManager::new(3);
    events.report(EdgeId(2), 4.0, 5.0).unwrap();

    for _ in 0..4 {
        assert_eq!(events.tick(1.0), 0);
    }
    assert_eq!(events.penalty(EdgeId(2), events.now(), SeverityPolicy::Max), 4.0);

    assert_eq!(events.tick(1.0), 1);
    assert_eq!(events.now(), 5.0);
    for at in [5.0, 5.5, 100.0] {
        assert_eq!(events.penalty(EdgeId(2), at, SeverityPolicy::Sum), 0.0);
    }
    assert!(events.active_incidents(EdgeId(2)).is_empty());
}

#[test]
fn test_penalty_at_expiry_time_even_before_tick() {
    let events = EventManager::new(1);
    events.report(EdgeId(0), 3.0, 2.0).unwrap();
    assert_eq!(events.penalty(EdgeId(0), 1.9, SeverityPolicy::Max), 3.0);
    assert_eq!(events.penalty(EdgeId(0), 2.0, SeverityPolicy::Max), 0.0);
}

#[test]
fn test_sweep_purges_only_expired() {
    let events = EventManager::new(2);
    events.report(EdgeId(0), 1.0, 1.0).unwrap();
    events.report(EdgeId(0), 1.0, 10.0).unwrap();
    events.report(EdgeId(1), 1.0, 0.0).unwrap();

    events.tick(2.0);
    assert_eq!(events.sweep(), 2);
    assert_eq!(events.sweep(), 0);

    let remaining = events.all_active();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].state, IncidentState::Active);
    assert_eq!(remaining[0].remaining_ttl(events.now()), 8.0);
}

#[test]
fn test_overlapping_incidents_are_not_merged() {
    let events = EventManager::new(1);
    let first = events.report(EdgeId(0), 2.0, 5.0).unwrap();
    let second = events.report(EdgeId(0), 5.0, 5.0).unwrap();
    assert_ne!(first, second);

    assert_eq!(events.active_incidents(EdgeId(0)).len(), 2);
    assert_eq!(events.penalty(EdgeId(0), 0.0, SeverityPolicy::Max), 5.0);
    assert_eq!(events.penalty(EdgeId(0), 0.0, SeverityPolicy::Sum), 7.0);

    assert!(events.clear(second));
    assert!(!events.clear(second));
    assert_eq!(events.penalty(EdgeId(0), 0.0, SeverityPolicy::Max), 2.0);
}

#[test]
fn test_temporary_block_marks_edge_blocked() {
    let events = EventManager::new(3);
    events.report(EdgeId(0), BLOCKED_THRESHOLD - 1.0, 5.0).unwrap();
    events.spawn_temporary_block(EdgeId(2), 3.0).unwrap();
    events.spawn_temporary_block(EdgeId(2), 4.0).unwrap();

    assert!(!events.is_blocked(EdgeId(0)));
    assert!(events.is_blocked(EdgeId(2)));
    assert_eq!(events.blocked_edges(), vec![EdgeId(2)]);

    events.tick(4.0);
    assert!(!events.is_blocked(EdgeId(2)));
    assert!(events.blocked_edges().is_empty());
}

#[test]
fn test_concurrent_reports_keep_every_incident() {
    let events = std::sync::Arc::new(EventManager::new(4));
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let events = events.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    events.report(EdgeId((t + i) % 4), 1.0, 100.0).unwrap();
                    if i % 10 == 0 {
                        events.tick(0.01);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let all = events.all_active();
    assert_eq!(all.len(), 400);
    let mut ids: Vec<u64> = all.iter().map(|inc| inc.id.0).collect();
    ids.dedup();
    assert_eq!(ids.len(), 400);
}
