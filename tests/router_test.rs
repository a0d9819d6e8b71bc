//! Routing tests over the dynamic edge costs

use smart_traffic::simulation::{City, NodeId, Router, SimConfig, SimError};
use std::sync::Arc;

fn grid(width: u32, height: u32) -> Arc<City> {
    City::from_config(&SimConfig::small(width, height)).unwrap()
}

fn n(x: u32, y: u32) -> NodeId {
    NodeId::new(x, y)
}

#[test]
fn test_straight_route() {
    let city = grid(5, 5);
    let router = Router::new(&city, 0.5);
    let route = router.shortest_path(n(0, 2), n(4, 2), 0.0).unwrap();

    assert_eq!(route.nodes, vec![n(0, 2), n(1, 2), n(2, 2), n(3, 2), n(4, 2)]);
    assert_eq!(route.hops(), 4);
    assert_eq!(route.total_cost, 4.0);
    assert_eq!(route.edges.len(), route.planned_costs.len());
    assert_eq!(route.origin(), n(0, 2));
    assert_eq!(route.destination(), n(4, 2));
}

#[test]
fn test_route_to_self_is_empty() {
    let city = grid(3, 3);
    let route = Router::new(&city, 0.5)
        .shortest_path(n(1, 1), n(1, 1), 0.0)
        .unwrap();
    assert_eq!(route.nodes, vec![n(1, 1)]);
    assert!(route.edges.is_empty());
    assert_eq!(route.total_cost, 0.0);
}

/// Equal-cost, equal-length paths resolve to the smaller node sequence
#[test]
fn test_tie_break_prefers_smaller_node_sequence() {
    let city = grid(3, 3);
    let router = Router::new(&city, 0.5);
    let route = router.shortest_path(n(0, 0), n(1, 1), 0.0).unwrap();
    assert_eq!(route.nodes, vec![n(0, 0), n(0, 1), n(1, 1)]);

    let back = router.shortest_path(n(1, 1), n(0, 0), 0.0).unwrap();
    assert_eq!(back.nodes, vec![n(1, 1), n(0, 1), n(0, 0)]);
}

#[test]
fn test_tie_break_prefers_fewer_hops() {
    let city = grid(3, 3);
    let direct = city.graph.edge_between(n(0, 0), n(1, 0)).unwrap();
    // The direct road now costs exactly as much as the three-hop detour
    city.events.report(direct, 2.0, 10.0).unwrap();

    let route = Router::new(&city, 0.5)
        .shortest_path(n(0, 0), n(1, 0), 0.0)
        .unwrap();
    assert_eq!(route.nodes, vec![n(0, 0), n(1, 0)]);
    assert_eq!(route.total_cost, 3.0);
}

#[test]
fn test_repeated_queries_are_deterministic() {
    let city = grid(6, 6);
    city.events.report(city.graph.edge_between(n(2, 2), n(3, 2)).unwrap(), 5.0, 10.0).unwrap();
    city.events.report(city.graph.edge_between(n(1, 4), n(1, 5)).unwrap(), 1.0, 10.0).unwrap();
    let router = Router::new(&city, 0.5);

    let first = router.shortest_path(n(0, 0), n(5, 5), 1.0).unwrap();
    for _ in 0..20 {
        assert_eq!(router.shortest_path(n(0, 0), n(5, 5), 1.0).unwrap(), first);
    }
    assert_eq!(first.total_cost, 10.0);
}

#[test]
fn test_route_avoids_heavy_incident() {
    let city = grid(5, 5);
    let blocked = city.graph.edge_between(n(1, 0), n(2, 0)).unwrap();
    city.events.spawn_temporary_block(blocked, 30.0).unwrap();

    let route = Router::new(&city, 0.5)
        .shortest_path(n(0, 0), n(4, 0), 0.0)
        .unwrap();
    assert!(!route.edges.contains(&blocked));
    assert_eq!(route.total_cost, 6.0);
}

/// 3x3 grid: an incident on the only edge of the shortest path raises the
/// route cost, and once it expires the recomputed cost is back to baseline
#[test]
fn test_route_cost_recovers_after_incident_expires() {
    let city = grid(3, 3);
    let router = Router::new(&city, 0.5);
    let (origin, destination) = (n(0, 0), n(1, 0));

    let before = router
        .shortest_path(origin, destination, city.events.now())
        .unwrap();
    assert_eq!(before.hops(), 1);
    let edge = before.edges[0];

    city.events.report(edge, 2.0, 5.0).unwrap();
    let during = router
        .shortest_path(origin, destination, city.events.now())
        .unwrap();
    assert!(during.total_cost > before.total_cost);
    assert!(router.is_invalidated(&before, 0, city.events.now()));

    for _ in 0..5 {
        city.events.tick(1.0);
    }
    let after = router
        .shortest_path(origin, destination, city.events.now())
        .unwrap();
    assert_eq!(after.total_cost, before.total_cost);
    assert_eq!(after.nodes, before.nodes);
    assert!(!router.is_invalidated(&before, 0, city.events.now()));
}

#[test]
fn test_invalidation_ignores_edges_behind() {
    let city = grid(4, 1);
    let router = Router::new(&city, 0.5);
    let route = router.shortest_path(n(0, 0), n(3, 0), 0.0).unwrap();

    city.events.report(route.edges[0], 5.0, 10.0).unwrap();
    assert!(router.is_invalidated(&route, 0, 0.0));
    assert!(!router.is_invalidated(&route, 1, 0.0));
    assert_eq!(router.route_cost(&route, 0.0), 8.0);
}

#[test]
fn test_small_cost_change_does_not_invalidate() {
    let city = grid(4, 1);
    let router = Router::new(&city, 0.5);
    let route = router.shortest_path(n(0, 0), n(3, 0), 0.0).unwrap();
    city.events.report(route.edges[1], 0.4, 10.0).unwrap();
    assert!(!router.is_invalidated(&route, 0, 0.0));
}

#[test]
fn test_unknown_node_is_routing_failure() {
    let city = grid(3, 3);
    let err = Router::new(&city, 0.5)
        .shortest_path(n(0, 0), n(7, 7), 0.0)
        .unwrap_err();
    assert_eq!(
        err,
        SimError::RoutingFailure {
            origin: n(0, 0),
            destination: n(7, 7)
        }
    );
    assert!(err.is_fatal());
}
