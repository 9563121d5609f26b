use std::collections::HashSet;

use crate::command::{CommandChannel, NetCommand, ObjectCommand, PropKey, decode_commands};
use crate::ids::{ClientId, NodeId, SERVER_CLIENT_ID};
use crate::reconcile::{Replication, Role};
use crate::registry::{ControlRef, ControlTable};
use crate::snapshot::{ControlRecord, RecordKind};
use crate::stamp::next_entity_stamp;
use crate::wire::{WireReader, WireWriter};
use crate::world::{EntityHandle, EntityWorld, SpawnRequest};

use super::frame::{read_records, read_server_header, write_client_header};
use super::{GameStatus, PURGE_INTERVAL_TICKS, PeerFrame, PeerTelemetry, SessionConfig, SessionEvent};

/// One connected client's side of a session.
#[derive(Debug)]
pub struct ClientSession {
    rep: Replication,
    client_id: ClientId,
    status: GameStatus,
    server_status: GameStatus,
    num_players: u32,
    channel: CommandChannel,
    telemetry: PeerTelemetry,
    cursor: usize,
    tick: u64,
    ticks_waiting: u32,
    server_buffers: u32,
    avatars_reserved: bool,
    local_only: bool,
    leaving: bool,
}

impl ClientSession {
    pub fn new(client_id: ClientId, config: SessionConfig) -> Self {
        let channel = CommandChannel::new(config.max_retained_command_packets);
        Self {
            rep: Replication::new(Role::Client(client_id), config),
            client_id,
            status: GameStatus::Menu,
            server_status: GameStatus::Menu,
            num_players: 0,
            channel,
            telemetry: PeerTelemetry::default(),
            cursor: 0,
            tick: 0,
            ticks_waiting: 0,
            server_buffers: 0,
            avatars_reserved: false,
            local_only: false,
            leaving: false,
        }
    }

    pub fn replication(&self) -> &Replication {
        &self.rep
    }

    pub fn config(&self) -> &SessionConfig {
        self.rep.config()
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn status(&self) -> GameStatus {
        self.status
    }

    pub fn server_status(&self) -> GameStatus {
        self.server_status
    }

    /// True after the server was given up on.
    pub fn is_local_only(&self) -> bool {
        self.local_only
    }

    pub fn set_telemetry(&mut self, telemetry: PeerTelemetry) {
        self.telemetry = telemetry;
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.rep.drain_events()
    }

    /// Starts the handshake for `num_players` local players.
    pub fn connect(&mut self, num_players: u32) {
        self.num_players = num_players.clamp(1, self.rep.config().players_per_client);
        self.ticks_waiting = 0;
        self.server_buffers = 0;
        self.local_only = false;
        self.set_status(GameStatus::ClientLoadingServerObjects);
    }

    /// Changes the local status and reports it to the server. Going back
    /// to Menu drops every mirror on the next tick; `connect` rejoins.
    pub fn set_status(&mut self, status: GameStatus) {
        if self.status == status {
            return;
        }
        log::info!("client {} status {} -> {}", self.client_id, self.status, status);
        if status == GameStatus::Menu && self.status > GameStatus::Menu {
            self.leaving = true;
        }
        self.status = status;
        self.push_command(ObjectCommand::game_status(
            status,
            self.client_id,
            self.num_players,
        ));
        self.rep.push_event(SessionEvent::StatusChanged {
            client: self.client_id,
            status,
        });
    }

    /// Asks the server to bring this client back after an EndGame. The
    /// local status stays EndGame until the server answers Running.
    pub fn request_reborn(&mut self) -> bool {
        if self.status != GameStatus::EndGame {
            return false;
        }
        log::info!("client {} requests reborn", self.client_id);
        self.push_command(ObjectCommand::game_status(
            GameStatus::StartGame,
            self.client_id,
            self.num_players,
        ));
        true
    }

    pub fn push_command(&mut self, command: ObjectCommand) {
        self.channel
            .outbox
            .push(&command.from_origin(self.client_id));
    }

    /// Starts replicating an entity created on this client.
    pub fn spawn<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        entity: EntityHandle,
        holder: Option<EntityHandle>,
        allow_speculative: bool,
    ) -> Option<ControlRef> {
        self.rep
            .add_spawn_control(world, entity, holder, true, allow_speculative)
    }

    /// Destroys one of this client's entities. The server learns it from
    /// the death sentinel.
    pub fn destroy<W: EntityWorld + ?Sized>(&mut self, world: &mut W, client_node_id: NodeId) -> bool {
        match self.rep.registry.find_client(client_node_id) {
            Some(control) => self.rep.destroy_control(world, control).is_some(),
            None => {
                log::warn!("destroy: cid={} is not a local control", client_node_id);
                false
            }
        }
    }

    /// Leaves the session and drops every mirrored entity.
    pub fn disconnect<W: EntityWorld + ?Sized>(&mut self, world: &mut W) {
        self.purge_mirrors(world);
        self.channel.reset();
        self.status = GameStatus::Menu;
        self.server_status = GameStatus::Menu;
        log::info!("client {} disconnected", self.client_id);
    }

    fn purge_mirrors<W: EntityWorld + ?Sized>(&mut self, world: &mut W) {
        let destroyed = self.rep.registry.purge_all(world, self.client_id);
        for id in destroyed {
            self.rep.push_event(SessionEvent::EntityDestroyed { id });
        }
        self.rep.spawns.clear();
    }

    fn apply_server_status<W: EntityWorld + ?Sized>(&mut self, world: &mut W, status: GameStatus) {
        let need_sync = self.rep.config().need_synchronization;
        log::debug!("client {} server status {}", self.client_id, status);
        self.server_status = status;
        self.rep.push_event(SessionEvent::StatusChanged {
            client: SERVER_CLIENT_ID,
            status,
        });

        match status {
            GameStatus::KillClients => {
                log::info!("client {} killed by the server", self.client_id);
                self.purge_mirrors(world);
                self.status = GameStatus::Menu;
                self.rep.push_event(SessionEvent::Disconnected {
                    client: self.client_id,
                });
            }
            GameStatus::Menu => self.purge_mirrors(world),
            GameStatus::Running
                if self.status == GameStatus::Synchronizing && need_sync =>
            {
                self.become_ready();
            }
            s if s >= GameStatus::Synchronizing
                && self.status == GameStatus::Synchronizing
                && !need_sync =>
            {
                self.become_ready();
            }
            GameStatus::Running if self.status == GameStatus::EndGame => {
                self.status = GameStatus::Running;
                self.rep.push_event(SessionEvent::StatusChanged {
                    client: self.client_id,
                    status: GameStatus::Running,
                });
            }
            _ => {}
        }
    }

    fn become_ready(&mut self) {
        self.rep.spawns.resync();
        self.set_status(GameStatus::Ready);
    }

    fn accepts(&self, command: &ObjectCommand) -> bool {
        if command.kind == NetCommand::GameStatus && command.origin == SERVER_CLIENT_ID {
            return true;
        }
        if self.status == GameStatus::Menu {
            return false;
        }
        if !command.broadcast {
            return command
                .get_u32(PropKey::CLIENT_ID)
                .is_none_or(|c| c == self.client_id as u32);
        }
        command.origin != self.client_id
    }

    fn apply_command<W: EntityWorld + ?Sized>(&mut self, world: &mut W, command: ObjectCommand) {
        if !self.accepts(&command) {
            log::trace!("client {} skips {:?} from {}", self.client_id, command.kind, command.origin);
            return;
        }

        match command.kind {
            NetCommand::GameStatus => {
                let Some(status) = command.status() else {
                    log::warn!("status command without status");
                    return;
                };
                let targeted = command
                    .get_u32(PropKey::CLIENT_ID)
                    .is_some_and(|c| c == self.client_id as u32);
                if targeted && matches!(status, GameStatus::EndGame | GameStatus::WinGame) {
                    self.status = status;
                    self.rep.push_event(SessionEvent::StatusChanged {
                        client: self.client_id,
                        status,
                    });
                }
                self.apply_server_status(world, status);
            }
            NetCommand::EraseNode => {
                if let Some(id) = command.node_id() {
                    self.rep.erase_node(world, id);
                }
            }
            NetCommand::EnableNode => {
                if let Some(id) = command.node_id() {
                    let enable = command.get_bool(PropKey::ENABLE).unwrap_or(true);
                    self.rep.enable_node(world, id, enable);
                }
            }
            NetCommand::DisableClientObjectControl => {
                if let Some(id) = command.node_id() {
                    self.rep.disable_client_control(id);
                }
            }
            _ => {
                let from = command.origin;
                self.rep.push_event(SessionEvent::Command { from, command });
            }
        }
    }

    /// Applies one frame received from the server.
    pub fn receive<W: EntityWorld + ?Sized>(&mut self, world: &mut W, frame: &PeerFrame) {
        if self.local_only {
            return;
        }
        self.channel.outbox.acknowledge(frame.command_ack);

        if !frame.controls.is_empty() {
            self.receive_controls(world, &frame.controls);
        }

        if !frame.commands.is_empty() {
            if let Err(e) = self.channel.inbox.receive(&frame.commands) {
                log::warn!("client {} command framing: {}", self.client_id, e);
            }
        }
        for payload in self.channel.inbox.drain() {
            match decode_commands(&payload) {
                Ok(commands) => {
                    for command in commands {
                        self.apply_command(world, command);
                    }
                }
                Err(e) => log::warn!("client {} command packet dropped: {}", self.client_id, e),
            }
        }
    }

    fn receive_controls<W: EntityWorld + ?Sized>(&mut self, world: &mut W, controls: &[u8]) {
        let mut reader = WireReader::new(controls);
        let (status, stamps) = match read_server_header(&mut reader) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("client {} control header: {}", self.client_id, e);
                return;
            }
        };
        if self.status != GameStatus::Menu {
            self.server_buffers = self.server_buffers.saturating_add(1);
            self.rep.spawns.merge_received_stamps(&stamps);
        }
        if status != self.server_status {
            self.apply_server_status(world, status);
        }
        if self.status == GameStatus::Menu {
            return;
        }

        let format = self.rep.config().wire;
        let layout = *self.rep.registry.layout();
        for record in read_records(&mut reader, format) {
            match record.kind {
                RecordKind::Full => {
                    self.rep.client_receive_full(world, &record);
                }
                RecordKind::Ack => {
                    if record.client_id != self.client_id {
                        log::warn!(
                            "client {} got an ack for client {}, dropped",
                            self.client_id,
                            record.client_id
                        );
                        continue;
                    }
                    let own_avatar = layout.avatar_owner(record.server_id) == Some(self.client_id);
                    self.rep.client_receive_ack(world, &record);
                    if own_avatar
                        && record.snapshot.is_enabled()
                        && self.status == GameStatus::StartGame
                    {
                        self.set_status(GameStatus::Running);
                    }
                }
            }
        }
    }

    fn reserve_avatars<W: EntityWorld + ?Sized>(&mut self, world: &mut W) {
        if self.avatars_reserved {
            return;
        }
        for id in self.rep.registry.layout().avatar_ids() {
            world.reserve_id(id);
        }
        self.avatars_reserved = true;
    }

    fn spawn_avatars<W: EntityWorld + ?Sized>(&mut self, world: &mut W) {
        let layout = *self.rep.registry.layout();
        for player in 0..self.num_players {
            let Some(id) = layout.avatar_id(self.client_id, player) else {
                continue;
            };
            let entity = world.lookup(id).filter(|e| world.is_usable(*e)).or_else(|| {
                world.spawn(&SpawnRequest {
                    id: Some(id),
                    owner: self.client_id,
                    enabled: true,
                    snapshot: Default::default(),
                })
            });
            let Some(entity) = entity else {
                log::warn!("client {} avatar {} could not be spawned", self.client_id, id);
                continue;
            };
            if self
                .rep
                .add_spawn_control(world, entity, None, true, false)
                .is_some()
            {
                self.rep.push_event(SessionEvent::EntitySpawned {
                    id,
                    owner: self.client_id,
                });
            }
        }
    }

    fn advance_handshake<W: EntityWorld + ?Sized>(&mut self, world: &mut W) {
        match self.status {
            GameStatus::ClientLoadingServerObjects if self.server_buffers > 0 => {
                self.set_status(GameStatus::ClientLoadingReplicatedNodes);
            }
            GameStatus::ClientLoadingReplicatedNodes if self.server_buffers > 1 => {
                self.set_status(GameStatus::Synchronizing);
            }
            GameStatus::Synchronizing
                if !self.rep.config().need_synchronization
                    && self.server_status >= GameStatus::Synchronizing =>
            {
                self.become_ready();
            }
            GameStatus::Ready => {
                self.spawn_avatars(world);
                self.set_status(GameStatus::StartGame);
            }
            _ => {}
        }
    }

    fn write_controls<W: EntityWorld + ?Sized>(&mut self, world: &W, writer: &mut WireWriter) {
        let format = self.rep.config().wire;
        let cap = self.rep.config().max_client_controls_per_tick;
        let history = self.rep.config().sent_history_len;
        let refs = self.rep.registry.refs(ControlTable::Client);
        if refs.is_empty() {
            return;
        }
        let start = self.cursor % refs.len();
        let mut written = 0;
        let mut visited = 0;

        while visited < refs.len() && written < cap {
            let control = refs[(start + visited) % refs.len()];
            visited += 1;

            if !self.rep.registry.get(control).is_some_and(|i| i.active) {
                continue;
            }
            if !self.rep.prepare_control(world, control) {
                continue;
            }
            let Some(info) = self.rep.registry.get_mut(control) else {
                continue;
            };
            info.prepared_control.states.stamp = next_entity_stamp(info.prepared_control.states.stamp);
            let record = ControlRecord::full(
                self.client_id,
                info.server_node_id,
                info.client_node_id,
                info.prepared_control,
            );
            record.write(writer, format);
            info.push_sent(history);
            self.rep.finish_send(control);
            written += 1;
        }
        self.cursor = (start + visited) % refs.len();
    }

    /// One network update. `None` once the session runs without a server.
    pub fn tick<W: EntityWorld + ?Sized>(&mut self, world: &mut W) -> Option<PeerFrame> {
        if self.local_only {
            return None;
        }
        self.tick += 1;
        self.reserve_avatars(world);
        if self.leaving {
            self.leaving = false;
            self.purge_mirrors(world);
        }

        if self.status > GameStatus::Menu && self.status < GameStatus::Ready {
            self.ticks_waiting += 1;
            if self.ticks_waiting > self.rep.config().sync_timeout_ticks {
                log::warn!(
                    "client {} no sync after {} ticks, falling back to local",
                    self.client_id,
                    self.ticks_waiting
                );
                self.local_only = true;
                self.rep.push_event(SessionEvent::FallbackToLocal);
                return None;
            }
        }
        self.advance_handshake(world);

        let mut writer = WireWriter::new();
        write_client_header(
            &mut writer,
            self.status,
            self.rep.spawns.local_stamp(self.client_id),
        );
        if self.status >= GameStatus::Ready {
            self.write_controls(world, &mut writer);
        }

        let interval = self.rep.config().resend_interval(self.telemetry.rtt_ms);
        let commands = self.channel.outbox.flush(interval).unwrap_or_default();

        if self.tick % PURGE_INTERVAL_TICKS == 0 {
            let keep: HashSet<ControlRef> = self.rep.spawns.mapped_controls();
            self.rep.registry.purge_inactive(&keep);
        }

        Some(PeerFrame {
            command_ack: self.channel.inbox.ack(),
            controls: writer.into_inner(),
            commands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::SceneWorld;

    #[test]
    fn connect_reports_status() {
        let mut world = SceneWorld::new();
        let mut client = ClientSession::new(3, SessionConfig::default());
        client.connect(2);
        let frame = client.tick(&mut world).unwrap();

        let commands = crate::command::read_frames(&frame.commands).unwrap();
        assert_eq!(commands.len(), 1);
        let decoded = decode_commands(commands[0].1).unwrap();
        assert_eq!(decoded[0].status(), Some(GameStatus::ClientLoadingServerObjects));
        assert_eq!(decoded[0].origin, 3);
        assert_eq!(decoded[0].get_u32(PropKey::NUM_PLAYERS), Some(2));
    }

    #[test]
    fn falls_back_after_timeout() {
        let mut world = SceneWorld::new();
        let config = SessionConfig {
            sync_timeout_ticks: 5,
            ..Default::default()
        };
        let mut client = ClientSession::new(1, config);
        client.connect(1);
        for _ in 0..5 {
            assert!(client.tick(&mut world).is_some());
        }
        assert!(client.tick(&mut world).is_none());
        assert!(client.is_local_only());
        assert!(client.drain_events().contains(&SessionEvent::FallbackToLocal));
    }

    #[test]
    fn filters_own_broadcasts() {
        let client = ClientSession::new(2, SessionConfig::default());
        let mut client = client;
        client.status = GameStatus::Running;

        let own = ObjectCommand::new(NetCommand::TrigClicked).from_origin(2).broadcast(true);
        let other = ObjectCommand::new(NetCommand::TrigClicked).from_origin(1).broadcast(true);
        let targeted = ObjectCommand::new(NetCommand::TrigClicked)
            .with(PropKey::CLIENT_ID, crate::command::PropValue::U32(4));
        assert!(!client.accepts(&own));
        assert!(client.accepts(&other));
        assert!(!client.accepts(&targeted));

        client.status = GameStatus::Menu;
        assert!(!client.accepts(&other));
        let status = ObjectCommand::game_status(GameStatus::Running, 0, 0);
        assert!(client.accepts(&status));
    }
}
