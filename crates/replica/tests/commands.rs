mod common;

use common::{Harness, Link};
use replica::{ClientId, NetCommand, ObjectCommand, PropKey, PropValue, SessionConfig, SessionEvent};

fn running_pair(seed: u64) -> Harness {
    let mut harness = Harness::new(SessionConfig::default());
    for id in [1, 2] {
        harness.connect(
            id,
            SessionConfig::default(),
            Link::lossy(15, 10, 2, seed + id as u64),
            Link::lossy(15, 10, 2, seed * 3 + id as u64),
        );
    }
    assert!(harness.run_until(800, Harness::all_running), "clients never started");
    for peer in &mut harness.clients {
        peer.events.clear();
    }
    harness.server_events.clear();
    harness
}

fn clicks(events: &[SessionEvent]) -> Vec<(ClientId, u32)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Command { from, command } if command.kind == NetCommand::TrigClicked => {
                Some((*from, command.get_u32(PropKey::FIRST_GAME_KEY)?))
            }
            _ => None,
        })
        .collect()
}

fn click(n: u32) -> ObjectCommand {
    ObjectCommand::new(NetCommand::TrigClicked)
        .with(PropKey::FIRST_GAME_KEY, PropValue::U32(n))
        .broadcast(true)
}

#[test]
fn broadcasts_arrive_in_order_exactly_once() {
    let mut harness = running_pair(5);

    for n in 0..12 {
        harness.client_mut(1).session.push_command(click(n));
        if n % 3 == 0 {
            harness.step();
        }
    }
    harness.run(120);

    let expected: Vec<(ClientId, u32)> = (0..12).map(|n| (1, n)).collect();
    assert_eq!(clicks(&harness.client(2).events), expected);
    assert_eq!(clicks(&harness.server_events), expected);
    assert!(clicks(&harness.client(1).events).is_empty(), "broadcast echoed to its sender");
}

#[test]
fn both_directions_interleave_per_sender() {
    let mut harness = running_pair(17);

    for n in 0..6 {
        harness.client_mut(1).session.push_command(click(n));
        harness.client_mut(2).session.push_command(click(100 + n));
        harness.step();
    }
    harness.run(120);

    let from_one: Vec<(ClientId, u32)> = (0..6).map(|n| (1, n)).collect();
    let from_two: Vec<(ClientId, u32)> = (0..6).map(|n| (2, 100 + n)).collect();
    assert_eq!(clicks(&harness.client(2).events), from_one);
    assert_eq!(clicks(&harness.client(1).events), from_two);
}

#[test]
fn targeted_server_command_reaches_one_client() {
    let mut harness = running_pair(29);

    let payload = vec![7u8, 1, 2, 3];
    harness.server.send_to(
        2,
        ObjectCommand::new(NetCommand::EntitySelected)
            .with(PropKey::PAYLOAD, PropValue::Bytes(payload.clone())),
    );
    harness.run(80);

    let received: Vec<&ObjectCommand> = harness
        .client(2)
        .events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Command { from: 0, command } => Some(command),
            _ => None,
        })
        .collect();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, NetCommand::EntitySelected);
    assert_eq!(received[0].get_bytes(PropKey::PAYLOAD), Some(payload.as_slice()));

    assert!(
        !harness
            .client(1)
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::Command { .. }))
    );
}
