//! Traffic light arbitration tests

use smart_traffic::simulation::{
    Agent, AgentContext, AgentId, City, Decision, EdgeId, Envelope, LightState, Message, NodeId,
    SimConfig, SimError, TrafficLight, TrafficLightAgent, VehicleId,
};

const RETRY: f64 = 0.5;
const HOLD: f64 = 5.0;

fn light() -> TrafficLight {
    TrafficLight::new(
        NodeId::new(2, 2),
        vec![EdgeId(0), EdgeId(1), EdgeId(2), EdgeId(3)],
        RETRY,
        HOLD,
    )
}

fn v(name: &str) -> VehicleId {
    VehicleId::new(name)
}

fn grant(name: &str, edge: usize) -> Decision {
    Decision::Grant {
        vehicle: v(name),
        edge: EdgeId(edge),
    }
}

fn deny(name: &str, edge: usize) -> Decision {
    Decision::Deny {
        vehicle: v(name),
        edge: EdgeId(edge),
        retry_after: RETRY,
    }
}

/// Two normal vehicles from crossing directions in the same cycle
#[test]
fn test_simultaneous_requests_grant_smaller_id() {
    let mut light = light();
    light.submit(v("car_b"), EdgeId(0), false, 1).unwrap();
    light.submit(v("car_a"), EdgeId(1), false, 1).unwrap();
    assert_eq!(light.state(), LightState::Evaluating);

    let decisions = light.arbitrate(0.0);
    assert_eq!(decisions, vec![grant("car_a", 1), deny("car_b", 0)]);
    assert_eq!(light.granted_vehicle(), Some(&v("car_a")));
    assert_eq!(light.state(), LightState::Idle);
    assert_eq!(light.queued_on(EdgeId(0)), 1);

    match &decisions[1] {
        Decision::Deny { retry_after, .. } => assert!(*retry_after > 0.0),
        other => panic!("expected a deny, got {other:?}"),
    }
}

#[test]
fn test_earlier_cycle_beats_smaller_id() {
    let mut light = light();
    light.submit(v("holder"), EdgeId(0), false, 1).unwrap();
    light.arbitrate(0.0);

    light.submit(v("zed"), EdgeId(1), false, 2).unwrap();
    assert_eq!(light.arbitrate(0.1), vec![deny("zed", 1)]);
    light.submit(v("abe"), EdgeId(2), false, 3).unwrap();
    assert_eq!(light.arbitrate(0.2), vec![deny("abe", 2)]);

    // A re-request keeps the original place in line
    light.submit(v("zed"), EdgeId(1), false, 4).unwrap();
    light.release(&v("holder"), EdgeId(0)).unwrap();
    assert_eq!(light.arbitrate(0.3), vec![grant("zed", 1)]);
}

/// An emergency request takes over a normal grant in one cycle
#[test]
fn test_emergency_preempts_normal_grant() {
    let mut light = light();
    light.submit(v("car_a"), EdgeId(0), false, 1).unwrap();
    assert_eq!(light.arbitrate(0.0), vec![grant("car_a", 0)]);

    light.submit(v("ev_0"), EdgeId(3), true, 2).unwrap();
    let decisions = light.arbitrate(0.5);
    assert_eq!(decisions, vec![deny("car_a", 0), grant("ev_0", 3)]);
    assert_eq!(light.granted_vehicle(), Some(&v("ev_0")));

    // The preempted vehicle gets the light back once the emergency clears
    light.release(&v("ev_0"), EdgeId(3)).unwrap();
    assert_eq!(light.arbitrate(1.0), vec![grant("car_a", 0)]);
}

#[test]
fn test_emergency_does_not_preempt_emergency() {
    let mut light = light();
    light.submit(v("ev_0"), EdgeId(0), true, 1).unwrap();
    light.arbitrate(0.0);
    light.submit(v("ev_1"), EdgeId(1), true, 2).unwrap();
    assert_eq!(light.arbitrate(0.1), vec![deny("ev_1", 1)]);
    assert_eq!(light.granted_vehicle(), Some(&v("ev_0")));
}

#[test]
fn test_emergency_jumps_the_queue() {
    let mut light = light();
    light.submit(v("car_a"), EdgeId(0), true, 1).unwrap();
    light.submit(v("car_b"), EdgeId(1), false, 1).unwrap();
    light.submit(v("car_c"), EdgeId(2), false, 1).unwrap();
    light.arbitrate(0.0);
    light.submit(v("ev_9"), EdgeId(3), true, 2).unwrap();
    light.arbitrate(0.1);

    light.release(&v("car_a"), EdgeId(0)).unwrap();
    assert_eq!(light.arbitrate(0.2), vec![grant("ev_9", 3)]);
}

/// However requests interleave, at most one vehicle holds the light
#[test]
fn test_never_two_grants_at_once() {
    let mut light = light();
    let mut holder: Option<VehicleId> = None;
    for cycle in 0..40u64 {
        let name = format!("car_{}", cycle % 7);
        let priority = cycle % 11 == 0;
        let _ = light.submit(v(&name), EdgeId((cycle % 4) as usize), priority, cycle);
        if cycle % 3 == 0 {
            if let Some(h) = holder.take() {
                light.release(&h, EdgeId(0)).unwrap();
            }
        }
        let decisions = light.arbitrate(cycle as f64 * 0.1);
        let grants = decisions
            .iter()
            .filter(|d| matches!(d, Decision::Grant { .. }))
            .count();
        assert!(grants <= 1);
        holder = light.granted_vehicle().cloned();
    }
}

#[test]
fn test_release_hands_light_to_next_in_line() {
    let mut light = light();
    light.submit(v("a"), EdgeId(0), false, 1).unwrap();
    light.submit(v("b"), EdgeId(1), false, 1).unwrap();
    light.arbitrate(0.0);

    light.release(&v("a"), EdgeId(0)).unwrap();
    assert_eq!(light.arbitrate(1.0), vec![grant("b", 1)]);
    assert_eq!(light.queue_len(), 0);
}

#[test]
fn test_withdrawn_request_leaves_queue() {
    let mut light = light();
    light.submit(v("a"), EdgeId(0), false, 1).unwrap();
    light.submit(v("b"), EdgeId(1), false, 1).unwrap();
    light.arbitrate(0.0);

    light.release(&v("b"), EdgeId(1)).unwrap();
    assert_eq!(light.queue_len(), 0);
}

#[test]
fn test_protocol_violations_are_reported() {
    let mut light = light();
    let err = light.submit(v("a"), EdgeId(42), false, 1).unwrap_err();
    assert!(matches!(err, SimError::ProtocolViolation(_)));
    assert!(!err.is_fatal());

    let err = light.release(&v("stranger"), EdgeId(0)).unwrap_err();
    assert!(matches!(err, SimError::ProtocolViolation(_)));
}

#[test]
fn test_stale_grant_is_revoked() {
    let mut light = light();
    light.submit(v("lost"), EdgeId(0), false, 1).unwrap();
    light.submit(v("next"), EdgeId(1), false, 1).unwrap();
    light.arbitrate(1.0);
    assert_eq!(light.grant_deadline(), Some(1.0 + HOLD));

    assert!(light.expire_grant(5.9).is_empty());
    let decisions = light.expire_grant(6.0);
    assert_eq!(decisions, vec![deny("lost", 0), grant("next", 1)]);
    assert_eq!(light.granted_vehicle(), Some(&v("next")));
}

#[test]
fn test_holder_asking_again_is_regranted() {
    let mut light = light();
    light.submit(v("a"), EdgeId(0), false, 1).unwrap();
    light.arbitrate(0.0);
    light.submit(v("a"), EdgeId(0), false, 2).unwrap();
    assert_eq!(light.arbitrate(0.8), vec![grant("a", 0)]);
}

/// Nobody is let onto a road closed by an incident
#[test]
fn test_blocked_road_is_refused() {
    let mut light = light();
    light.update_blocked(|edge| edge == EdgeId(0));
    assert!(light.is_blocked(EdgeId(0)));

    light.submit(v("car_a"), EdgeId(0), true, 1).unwrap();
    light.submit(v("car_b"), EdgeId(1), false, 1).unwrap();
    assert_eq!(light.arbitrate(0.0), vec![grant("car_b", 1), deny("car_a", 0)]);
    assert_eq!(light.queued_on(EdgeId(0)), 1);

    // Still closed: asking again changes nothing
    light.release(&v("car_b"), EdgeId(1)).unwrap();
    light.submit(v("car_a"), EdgeId(0), true, 2).unwrap();
    assert_eq!(light.arbitrate(0.5), vec![deny("car_a", 0)]);
    assert_eq!(light.granted_vehicle(), None);

    light.update_blocked(|_| false);
    light.submit(v("car_a"), EdgeId(0), true, 3).unwrap();
    assert_eq!(light.arbitrate(1.0), vec![grant("car_a", 0)]);
}

#[test]
fn test_holder_is_not_regranted_onto_closed_road() {
    let mut light = light();
    light.submit(v("a"), EdgeId(2), false, 1).unwrap();
    light.arbitrate(0.0);

    light.update_blocked(|edge| edge == EdgeId(2));
    light.submit(v("a"), EdgeId(2), false, 2).unwrap();
    assert_eq!(light.arbitrate(0.8), vec![deny("a", 2)]);
    assert_eq!(light.granted_vehicle(), None);
}

fn envelope(from: &str, message: Message) -> Envelope {
    Envelope::new(
        AgentId::vehicle(&v(from)),
        AgentId::TrafficLight(NodeId::new(2, 2)),
        message,
    )
}

#[test]
fn test_agent_answers_a_batch_in_one_cycle() {
    let mut agent = TrafficLightAgent::new(light());
    let mut ctx = AgentContext::new(agent.id(), 0.0);
    let batch = vec![
        envelope(
            "car_b",
            Message::PassageRequest {
                vehicle_id: v("car_b"),
                edge: EdgeId(0),
                priority: false,
            },
        ),
        envelope(
            "car_a",
            Message::PassageRequest {
                vehicle_id: v("car_a"),
                edge: EdgeId(2),
                priority: false,
            },
        ),
        envelope(
            "car_c",
            Message::PassageRequest {
                vehicle_id: v("car_c"),
                edge: EdgeId(9),
                priority: false,
            },
        ),
    ];
    agent.on_batch(batch, &mut ctx).unwrap();

    let out = ctx.take_outbox();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].to, AgentId::vehicle(&v("car_a")));
    assert!(matches!(out[0].message, Message::PassageGrant { .. }));
    assert_eq!(out[1].to, AgentId::vehicle(&v("car_b")));
    assert!(matches!(out[1].message, Message::PassageDeny { .. }));
    assert_eq!(agent.next_wake(), Some(HOLD));

    let mut ctx = AgentContext::new(agent.id(), 0.5);
    agent
        .on_batch(
            vec![envelope(
                "car_a",
                Message::PassageRelease {
                    vehicle_id: v("car_a"),
                    edge: EdgeId(2),
                },
            )],
            &mut ctx,
        )
        .unwrap();
    let out = ctx.take_outbox();
    assert_eq!(out.len(), 1);
    assert_eq!(
        out[0].message,
        Message::PassageGrant {
            vehicle_id: v("car_b"),
            edge: EdgeId(0)
        }
    );
    assert_eq!(agent.light().granted_vehicle(), Some(&v("car_b")));
}

#[test]
fn test_agent_reads_closures_from_the_city() {
    let city = City::from_config(&SimConfig::small(3, 3)).unwrap();
    let corner = NodeId::new(0, 0);
    let east = city.graph.edge_between(corner, NodeId::new(1, 0)).unwrap();
    let south = city.graph.edge_between(corner, NodeId::new(0, 1)).unwrap();
    city.events.spawn_temporary_block(east, 30.0).unwrap();

    let edges = city.graph.neighbors(corner).into_iter().map(|(e, _)| e).collect();
    let mut agent =
        TrafficLightAgent::new(TrafficLight::new(corner, edges, RETRY, HOLD)).with_city(city);
    let request = |name: &str, edge: EdgeId| {
        Envelope::new(
            AgentId::vehicle(&v(name)),
            AgentId::TrafficLight(corner),
            Message::PassageRequest {
                vehicle_id: v(name),
                edge,
                priority: false,
            },
        )
    };

    let mut ctx = AgentContext::new(agent.id(), 0.0);
    agent
        .on_batch(vec![request("car_a", east), request("car_b", south)], &mut ctx)
        .unwrap();
    let out = ctx.take_outbox();
    assert_eq!(out.len(), 2);
    assert_eq!(
        out[0].message,
        Message::PassageGrant {
            vehicle_id: v("car_b"),
            edge: south
        }
    );
    assert_eq!(
        out[1].message,
        Message::PassageDeny {
            vehicle_id: v("car_a"),
            edge: east,
            retry_after: RETRY
        }
    );
}
