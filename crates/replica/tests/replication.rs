mod common;

use glam::Vec2;

use common::{Harness, Link};
use replica::{
    ClientId, EntityWorld, FIRST_LOCAL_ID, GameStatus, NetCommand, NodeId, ObjectCommand,
    PropKey, PropValue, SceneEntity, SceneWorld, SessionConfig, SessionEvent,
};

const PROJECTILE: u32 = 0x5052_4A31;
const WANDERER: u32 = 0x5741_4E44;

fn lossy_pair(seed: u64) -> Harness {
    let mut harness = Harness::new(SessionConfig::default());
    for id in [1, 2] {
        harness.connect(
            id,
            SessionConfig::default(),
            Link::lossy(10, 5, 2, seed + id as u64),
            Link::lossy(10, 5, 2, seed * 7 + id as u64),
        );
    }
    assert!(harness.run_until(600, Harness::all_running), "clients never started");
    harness
}

fn perfect_pair() -> Harness {
    let mut harness = Harness::new(SessionConfig::default());
    for id in [1, 2] {
        harness.connect(id, SessionConfig::default(), Link::perfect(), Link::perfect());
    }
    assert!(harness.run_until(200, Harness::all_running), "clients never started");
    harness
}

fn avatar(harness: &Harness, client: ClientId) -> NodeId {
    harness
        .server
        .config()
        .id_layout()
        .avatar_id(client, 0)
        .unwrap()
}

fn id_of_kind(world: &SceneWorld, kind: u32) -> Option<NodeId> {
    world.entities().find(|e| e.kind == kind).map(|e| e.id)
}

fn times_destroyed(world: &SceneWorld, id: NodeId) -> usize {
    world.destroyed().iter().filter(|&&d| d == id).count()
}

fn players_started(events: &[SessionEvent]) -> Vec<ClientId> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::PlayersStarted { client } => Some(*client),
            _ => None,
        })
        .collect()
}

/// Fires a projectile held by `client`'s first avatar.
fn fire(harness: &mut Harness, client: ClientId) {
    let shooter = avatar(harness, client);
    let peer = harness.client_mut(client);
    let holder = peer.world.lookup(shooter).unwrap();
    let handle = peer.world.insert(
        SceneEntity::new(0, PROJECTILE)
            .with_owner(client)
            .with_position(Vec2::new(1.0, 1.0)),
    );
    assert!(
        peer.session
            .spawn(&mut peer.world, handle, Some(holder), true)
            .is_some()
    );
}

#[test]
fn two_clients_reach_running_over_lossy_links() {
    let mut harness = lossy_pair(11);
    harness.run(40);

    for client in [1, 2] {
        assert_eq!(harness.server.client_status(client), Some(GameStatus::Running));
        assert!(
            harness
                .server_events
                .contains(&SessionEvent::PlayersStarted { client })
        );
    }
    assert_eq!(harness.server.status(), GameStatus::Running);

    for owner in [1, 2] {
        let id = avatar(&harness, owner);
        assert!(harness.server_world.get_by_id(id).is_some(), "server lacks avatar {}", id);
        for peer in &harness.clients {
            assert!(
                peer.world.get_by_id(id).is_some(),
                "client {} lacks avatar {}",
                peer.id(),
                id
            );
        }
    }
}

#[test]
fn avatar_movement_reaches_the_other_client() {
    let mut harness = lossy_pair(23);
    let id = avatar(&harness, 1);

    let target = Vec2::new(3.0, -2.0);
    if let Some(entity) = harness.client_mut(1).world.get_by_id_mut(id) {
        entity.physics.position = target;
    }
    harness.run(30);

    let on_server = harness.server_world.get_by_id(id).unwrap().physics.position;
    let on_other = harness.client(2).world.get_by_id(id).unwrap().physics.position;
    assert!((on_server - target).length() < 1e-3, "server at {:?}", on_server);
    assert!((on_other - target).length() < 1e-3, "client 2 at {:?}", on_other);
}

#[test]
fn speculative_projectile_mirrors_once_and_dies_once() {
    let mut harness = lossy_pair(37);
    fire(&mut harness, 1);
    let projectile = id_of_kind(&harness.client(1).world, PROJECTILE).unwrap();

    harness.run(40);
    assert_eq!(harness.server_world.count_of_kind(PROJECTILE), 1);
    assert_eq!(harness.client(1).world.count_of_kind(PROJECTILE), 1);
    assert_eq!(harness.client(2).world.count_of_kind(PROJECTILE), 1);

    let on_server = id_of_kind(&harness.server_world, PROJECTILE).unwrap();
    let on_other = id_of_kind(&harness.client(2).world, PROJECTILE).unwrap();

    let peer = harness.client_mut(1);
    assert!(peer.session.destroy(&mut peer.world, projectile));
    harness.run(60);

    assert_eq!(harness.server_world.count_of_kind(PROJECTILE), 0);
    assert_eq!(harness.client(1).world.count_of_kind(PROJECTILE), 0);
    assert_eq!(harness.client(2).world.count_of_kind(PROJECTILE), 0);
    assert_eq!(times_destroyed(&harness.server_world, on_server), 1);
    assert_eq!(times_destroyed(&harness.client(1).world, projectile), 1);
    assert_eq!(times_destroyed(&harness.client(2).world, on_other), 1);

    harness.run(150);
    assert_eq!(harness.server_world.count_of_kind(PROJECTILE), 0);
    assert_eq!(harness.client(2).world.count_of_kind(PROJECTILE), 0);
}

#[test]
fn server_destroy_reaches_every_client_once() {
    let mut harness = lossy_pair(53);

    let handle = harness.server_world.insert(
        SceneEntity::new(0, WANDERER).with_position(Vec2::new(-4.0, 0.0)),
    );
    let id = harness.server_world.get(handle).unwrap().id;
    assert!(
        harness
            .server
            .spawn(&mut harness.server_world, handle, None, true)
            .is_some()
    );
    harness.run(30);

    let mirrors: Vec<(ClientId, NodeId)> = harness
        .clients
        .iter()
        .map(|p| (p.id(), id_of_kind(&p.world, WANDERER).expect("mirror missing")))
        .collect();
    for peer in &harness.clients {
        assert_eq!(peer.world.count_of_kind(WANDERER), 1);
    }

    assert!(harness.server.destroy(&mut harness.server_world, id));
    harness.run(60);

    assert_eq!(harness.server_world.count_of_kind(WANDERER), 0);
    for (client, mirror) in mirrors {
        let peer = harness.client(client);
        assert_eq!(peer.world.count_of_kind(WANDERER), 0);
        assert_eq!(times_destroyed(&peer.world, mirror), 1, "client {}", client);
    }

    harness.run(150);
    for peer in &harness.clients {
        assert_eq!(peer.world.count_of_kind(WANDERER), 0);
    }
}

#[test]
fn stuck_client_is_excluded_from_the_barrier() {
    let server_config = SessionConfig {
        sync_timeout_ticks: 40,
        ..Default::default()
    };
    let mut harness = Harness::new(server_config);
    harness.connect(1, SessionConfig::default(), Link::perfect(), Link::perfect());
    harness.connect(2, SessionConfig::default(), Link::perfect(), Link::perfect());
    let mut silent = Link::perfect();
    silent.cut = true;
    harness.connect(3, SessionConfig::default(), Link::perfect(), silent);

    harness.run(20);
    assert!(!harness.server.allow_update());
    assert!(!harness.server.is_synchronized());

    let started = harness.run_until(400, |h| {
        h.server.allow_update()
            && h.client(1).status() == GameStatus::Running
            && h.client(2).status() == GameStatus::Running
    });
    assert!(started, "barrier never released");

    assert_eq!(
        harness.server.client_status(3),
        Some(GameStatus::ClientLoadingServerObjects)
    );
    assert_eq!(harness.client(3).status(), GameStatus::ClientLoadingServerObjects);
    assert_eq!(players_started(&harness.server_events), vec![1, 2]);
}

#[test]
fn silent_client_is_excluded_from_the_barrier() {
    let server_config = SessionConfig {
        sync_timeout_ticks: 40,
        ..Default::default()
    };
    let mut harness = Harness::new(server_config);
    harness.connect(1, SessionConfig::default(), Link::perfect(), Link::perfect());
    harness.connect(2, SessionConfig::default(), Link::perfect(), Link::perfect());
    let mut silent = Link::perfect();
    silent.cut = true;
    harness.connect(3, SessionConfig::default(), silent, Link::perfect());

    harness.run(30);
    assert_eq!(harness.server.client_status(3), Some(GameStatus::Menu));
    assert!(!harness.server.allow_update());
    assert!(!harness.server.is_synchronized());

    let started = harness.run_until(400, |h| {
        h.server.allow_update()
            && h.client(1).status() == GameStatus::Running
            && h.client(2).status() == GameStatus::Running
    });
    assert!(started, "barrier never released");
    assert_eq!(harness.server.client_status(3), Some(GameStatus::Menu));
    assert_eq!(players_started(&harness.server_events), vec![1, 2]);
}

#[test]
fn menu_then_rejoin_restores_the_client() {
    let mut harness = perfect_pair();
    let shooter = avatar(&harness, 1);
    fire(&mut harness, 1);
    harness.run(20);
    assert_eq!(harness.server_world.count_of_kind(PROJECTILE), 1);
    assert_eq!(harness.client(2).world.count_of_kind(PROJECTILE), 1);
    assert_ne!(harness.server.replication().spawns.received_stamp(1), 0);

    harness.client_mut(1).session.set_status(GameStatus::Menu);
    harness.run(20);
    assert_eq!(harness.server.client_status(1), Some(GameStatus::Menu));
    assert!(!harness.server.allow_update());
    assert_eq!(harness.server.replication().spawns.received_stamp(1), 0);
    assert_eq!(harness.client(1).session.replication().spawns.local_stamp(1), 0);
    assert_eq!(harness.server_world.count_of_kind(PROJECTILE), 0);
    assert_eq!(harness.client(2).world.count_of_kind(PROJECTILE), 0);
    assert!(harness.server_world.get_by_id(shooter).is_none());

    harness.server_events.clear();
    harness.client_mut(1).session.connect(1);
    assert!(harness.run_until(400, Harness::all_running), "rejoin never completed");
    assert_eq!(harness.server.client_status(1), Some(GameStatus::Running));
    assert_eq!(players_started(&harness.server_events), vec![1]);
    assert!(harness.server_world.get_by_id(shooter).is_some());

    harness.client_mut(1).session.push_command(
        ObjectCommand::new(NetCommand::TrigClicked)
            .with(PropKey::FIRST_GAME_KEY, PropValue::U32(9))
            .broadcast(true),
    );
    harness.run(20);
    assert!(
        harness
            .server_events
            .iter()
            .any(|e| matches!(e, SessionEvent::Command { from: 1, .. }))
    );
}

#[test]
fn ids_beyond_the_short_window_still_replicate() {
    let mut harness = perfect_pair();

    let near = harness.server_world.insert(SceneEntity::new(0, WANDERER));
    let far = harness
        .server_world
        .insert(SceneEntity::new(FIRST_LOCAL_ID + 70_000, PROJECTILE));
    for entity in [near, far] {
        assert!(
            harness
                .server
                .spawn(&mut harness.server_world, entity, None, true)
                .is_some()
        );
    }
    harness.run(30);

    for peer in &harness.clients {
        assert_eq!(peer.world.count_of_kind(WANDERER), 1, "client {}", peer.id());
        assert_eq!(peer.world.count_of_kind(PROJECTILE), 1, "client {}", peer.id());
    }
}

#[test]
fn disconnect_removes_owned_entities_everywhere() {
    let mut harness = perfect_pair();
    let leaving = avatar(&harness, 2);
    assert!(harness.client(1).world.get_by_id(leaving).is_some());
    fire(&mut harness, 2);
    harness.run(20);
    assert_eq!(harness.client(1).world.count_of_kind(PROJECTILE), 1);
    assert_ne!(harness.server.replication().spawns.received_stamp(2), 0);

    let peer = harness.client_mut(2);
    peer.session.disconnect(&mut peer.world);
    harness.server.remove_client(&mut harness.server_world, 2);
    harness.clients.retain(|p| p.id() != 2);
    harness.run(60);

    assert!(harness.server_world.get_by_id(leaving).is_none());
    assert!(harness.client(1).world.get_by_id(leaving).is_none());
    assert_eq!(harness.server_world.count_of_kind(PROJECTILE), 0);
    assert_eq!(harness.client(1).world.count_of_kind(PROJECTILE), 0);
    assert_eq!(harness.server.replication().spawns.received_stamp(2), 0);
    assert!(
        harness
            .server_events
            .contains(&SessionEvent::Disconnected { client: 2 })
    );
    assert_eq!(harness.client(1).status(), GameStatus::Running);
}

#[test]
fn end_game_and_reborn() {
    let mut harness = perfect_pair();

    harness.server.end_game(1);
    harness.run(10);
    assert_eq!(harness.client(1).status(), GameStatus::EndGame);
    assert_eq!(harness.server.client_status(1), Some(GameStatus::EndGame));
    assert_eq!(harness.client(2).status(), GameStatus::Running);

    assert!(harness.client_mut(1).session.request_reborn());
    harness.run(10);
    assert_eq!(harness.client(1).status(), GameStatus::Running);
    assert_eq!(harness.server.client_status(1), Some(GameStatus::Running));
    assert!(!harness.client_mut(2).session.request_reborn());
}
