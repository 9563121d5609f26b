use std::collections::{BTreeMap, HashSet};

use crate::command::{CommandChannel, NetCommand, ObjectCommand, PropKey, decode_commands};
use crate::ids::{ClientId, NodeId, SERVER_CLIENT_ID, spawn_id};
use crate::reconcile::{Replication, Role};
use crate::registry::{ControlRef, ControlTable};
use crate::snapshot::{ControlRecord, RecordKind};
use crate::wire::{WireReader, WireWriter};
use crate::world::{EntityHandle, EntityWorld};

use super::frame::{read_client_header, read_records, write_server_header};
use super::{GameStatus, PURGE_INTERVAL_TICKS, PeerFrame, PeerTelemetry, SessionConfig, SessionEvent};

#[derive(Debug)]
struct ClientState {
    status: GameStatus,
    num_players: u32,
    channel: CommandChannel,
    telemetry: PeerTelemetry,
    ticks_unsynced: u32,
    excluded: bool,
    avatars_allocated: bool,
    started: bool,
    reborn_requested: bool,
}

impl ClientState {
    fn new(config: &SessionConfig) -> Self {
        Self {
            status: GameStatus::Menu,
            num_players: 0,
            channel: CommandChannel::new(config.max_retained_command_packets),
            telemetry: PeerTelemetry::default(),
            ticks_unsynced: 0,
            excluded: false,
            avatars_allocated: false,
            started: false,
            reborn_requested: false,
        }
    }

    /// Takes part in the synchronization barriers. A connected client
    /// counts whatever its status until it is excluded.
    fn is_counted(&self) -> bool {
        !self.excluded
    }
}

/// Authoritative side of a session.
#[derive(Debug)]
pub struct ServerSession {
    rep: Replication,
    status: GameStatus,
    clients: BTreeMap<ClientId, ClientState>,
    cursor: usize,
    tick: u64,
    avatars_reserved: bool,
    synchronized: bool,
    all_running: bool,
    allow_update: bool,
}

impl ServerSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            rep: Replication::new(Role::Server, config),
            status: GameStatus::Menu,
            clients: BTreeMap::new(),
            cursor: 0,
            tick: 0,
            avatars_reserved: false,
            synchronized: false,
            all_running: false,
            allow_update: false,
        }
    }

    pub fn replication(&self) -> &Replication {
        &self.rep
    }

    pub fn config(&self) -> &SessionConfig {
        self.rep.config()
    }

    pub fn status(&self) -> GameStatus {
        self.status
    }

    pub fn set_status(&mut self, status: GameStatus) {
        if self.status == status {
            return;
        }
        log::info!("server status {} -> {}", self.status, status);
        self.status = status;
        self.rep.push_event(SessionEvent::StatusChanged {
            client: SERVER_CLIENT_ID,
            status,
        });
    }

    /// Simulation may advance.
    pub fn allow_update(&self) -> bool {
        self.allow_update
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn client_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.keys().copied()
    }

    pub fn client_status(&self, client: ClientId) -> Option<GameStatus> {
        self.clients.get(&client).map(|c| c.status)
    }

    pub fn client_players(&self, client: ClientId) -> Option<u32> {
        self.clients.get(&client).map(|c| c.num_players)
    }

    pub fn set_telemetry(&mut self, client: ClientId, telemetry: PeerTelemetry) {
        if let Some(state) = self.clients.get_mut(&client) {
            state.telemetry = telemetry;
        }
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.rep.drain_events()
    }

    pub fn add_client(&mut self, client: ClientId) {
        if client == SERVER_CLIENT_ID {
            log::error!("add_client: id 0 belongs to the server");
            return;
        }
        let config = self.rep.config().clone();
        self.clients.entry(client).or_insert_with(|| {
            log::info!("client {} joined", client);
            ClientState::new(&config)
        });
    }

    /// Connection loss. Same as the client reporting Menu, then forgotten.
    pub fn remove_client<W: EntityWorld + ?Sized>(&mut self, world: &mut W, client: ClientId) {
        if !self.clients.contains_key(&client) {
            return;
        }
        self.apply_client_status(world, client, GameStatus::Menu, 0);
        self.clients.remove(&client);
        self.rep.push_event(SessionEvent::Disconnected { client });
        log::info!("client {} removed", client);
    }

    /// Queues a command for every client.
    pub fn broadcast(&mut self, command: ObjectCommand) {
        let command = command.broadcast(true);
        for state in self.clients.values_mut() {
            state.channel.outbox.push(&command);
        }
    }

    /// Queues a command for one client.
    pub fn send_to(&mut self, client: ClientId, command: ObjectCommand) {
        match self.clients.get_mut(&client) {
            Some(state) => state.channel.outbox.push(&command.broadcast(false)),
            None => log::warn!("send_to: client {} unknown, {:?} dropped", client, command.kind),
        }
    }

    fn relay(&mut self, from: ClientId, command: &ObjectCommand) {
        for (&id, state) in self.clients.iter_mut() {
            if id != from {
                state.channel.outbox.push(command);
            }
        }
    }

    pub fn kill_clients(&mut self) {
        log::info!("kill clients");
        self.broadcast(ObjectCommand::game_status(
            GameStatus::KillClients,
            SERVER_CLIENT_ID,
            0,
        ));
    }

    /// Sends a client into EndGame. It comes back through a reborn request.
    pub fn end_game(&mut self, client: ClientId) {
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        state.status = GameStatus::EndGame;
        let players = state.num_players;
        self.send_to(
            client,
            ObjectCommand::game_status(GameStatus::EndGame, client, players),
        );
        self.rep.push_event(SessionEvent::StatusChanged {
            client,
            status: GameStatus::EndGame,
        });
    }

    /// Starts replicating an entity the server created.
    pub fn spawn<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        entity: EntityHandle,
        holder: Option<EntityHandle>,
        enable: bool,
    ) -> Option<ControlRef> {
        self.rep.add_spawn_control(world, entity, holder, enable, true)
    }

    /// Destroys a replicated entity and tells every client.
    pub fn destroy<W: EntityWorld + ?Sized>(&mut self, world: &mut W, id: NodeId) -> bool {
        if !self.rep.erase_node(world, id) {
            return false;
        }
        self.broadcast(ObjectCommand::erase_node(id));
        true
    }

    /// Drops everything a client owns and releases its spawn stamps. The
    /// command channel survives, so a rejoin continues on the same command
    /// stamps.
    fn teardown_client<W: EntityWorld + ?Sized>(&mut self, world: &mut W, client: ClientId) {
        let destroyed = self.rep.registry.remove_owned_by(world, client);
        self.rep.spawns.clear_client(client);
        for &id in &destroyed {
            self.rep.push_event(SessionEvent::EntityDestroyed { id });
        }
        if let Some(state) = self.clients.get_mut(&client) {
            state.status = GameStatus::Menu;
            state.num_players = 0;
            state.avatars_allocated = false;
            state.started = false;
            state.reborn_requested = false;
            state.ticks_unsynced = 0;
            state.excluded = false;
        }
        for id in destroyed {
            let command = ObjectCommand::erase_node(id).broadcast(true);
            self.relay(client, &command);
        }
        self.synchronized = false;
        self.all_running = false;
        self.allow_update = false;
    }

    fn apply_client_status<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        client: ClientId,
        status: GameStatus,
        num_players: u32,
    ) {
        let server_status = self.status;
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        let current = state.status;

        if status == GameStatus::Menu {
            if current > GameStatus::Menu {
                log::info!("client {} back to menu, tearing down", client);
                self.teardown_client(world, client);
                self.rep.push_event(SessionEvent::StatusChanged { client, status });
            }
            return;
        }

        if status.is_loading_window() && num_players > state.num_players {
            state.num_players = num_players.min(self.rep.config().players_per_client);
        }

        if current == GameStatus::EndGame
            && matches!(status, GameStatus::StartGame | GameStatus::Running)
        {
            log::debug!("client {} asks to be reborn", client);
            state.reborn_requested = true;
            return;
        }

        if status <= current {
            if status < current {
                log::debug!("client {} status {} behind {}, ignored", client, status, current);
            }
            return;
        }
        if status == GameStatus::KillClients || status == GameStatus::NoGameState {
            return;
        }

        log::info!("client {} status {} -> {}", client, current, status);
        state.status = status;
        let players = state.num_players;
        self.rep.push_event(SessionEvent::StatusChanged { client, status });

        if status == GameStatus::Synchronizing && server_status >= GameStatus::Ready {
            self.send_to(
                client,
                ObjectCommand::game_status(GameStatus::Running, client, players),
            );
        }
    }

    fn apply_command<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        from: ClientId,
        command: ObjectCommand,
    ) {
        if command.kind == NetCommand::GameStatus {
            match command.status() {
                Some(status) => {
                    let players = command.get_u32(PropKey::NUM_PLAYERS).unwrap_or(0);
                    self.apply_client_status(world, from, status, players);
                }
                None => log::warn!("client {} sent a status command without status", from),
            }
            return;
        }
        if self.status == GameStatus::Menu {
            return;
        }

        match command.kind {
            NetCommand::EraseNode => {
                let Some(id) = command.node_id() else {
                    return;
                };
                let owner = self
                    .rep
                    .registry
                    .find(id)
                    .and_then(|r| self.rep.registry.get(r))
                    .map(|info| info.client_id);
                if owner != Some(from) {
                    log::warn!("client {} erases id={} owned by {:?}, dropped", from, id, owner);
                    return;
                }
                self.destroy(world, id);
            }
            NetCommand::EnableNode => {
                if let Some(id) = command.node_id() {
                    let enable = command.get_bool(PropKey::ENABLE).unwrap_or(true);
                    self.rep.enable_node(world, id, enable);
                }
                if command.broadcast {
                    self.relay(from, &command);
                }
            }
            NetCommand::DisableClientObjectControl => {
                log::warn!("client {} sent {:?}, server only", from, command.kind);
            }
            _ => {
                if command.broadcast {
                    self.relay(from, &command);
                }
                self.rep.push_event(SessionEvent::Command { from, command });
            }
        }
    }

    /// Applies one frame received from `from`.
    pub fn receive<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        from: ClientId,
        frame: &PeerFrame,
    ) {
        let Some(state) = self.clients.get_mut(&from) else {
            log::warn!("frame from unknown client {}", from);
            return;
        };
        state.channel.outbox.acknowledge(frame.command_ack);

        if !frame.commands.is_empty() {
            if let Err(e) = state.channel.inbox.receive(&frame.commands) {
                log::warn!("client {} command framing: {}", from, e);
            }
        }
        let payloads = state.channel.inbox.drain();
        for payload in payloads {
            match decode_commands(&payload) {
                Ok(commands) => {
                    for command in commands {
                        self.apply_command(world, from, command.from_origin(from));
                    }
                }
                Err(e) => log::warn!("client {} command packet dropped: {}", from, e),
            }
        }

        if frame.controls.is_empty() {
            return;
        }
        if self.client_status(from) == Some(GameStatus::Menu) {
            log::trace!("client {} at menu, controls dropped", from);
            return;
        }
        let mut reader = WireReader::new(&frame.controls);
        let stamp = match read_client_header(&mut reader) {
            Ok((_, stamp)) => stamp,
            Err(e) => {
                log::warn!("client {} control header: {}", from, e);
                return;
            }
        };
        if let Some(stamp) = stamp {
            self.rep.spawns.note_received_stamp(from, stamp);
        }

        let format = self.rep.config().wire;
        for record in read_records(&mut reader, format) {
            match record.kind {
                RecordKind::Full => {
                    self.rep.server_receive(world, from, &record);
                }
                RecordKind::Ack => {
                    log::warn!("client {} sent an ack record, dropped", from);
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

    fn allocate_avatars<W: EntityWorld + ?Sized>(&mut self, world: &mut W) {
        let layout = *self.rep.registry.layout();
        let pending: Vec<(ClientId, u32)> = self
            .clients
            .iter()
            .filter(|(_, s)| !s.avatars_allocated && s.status.is_loading_window())
            .map(|(&id, s)| (id, s.num_players.max(1)))
            .collect();

        for (client, players) in pending {
            for player in 0..players {
                let Some(id) = layout.avatar_id(client, player) else {
                    log::warn!("client {} player {} has no avatar id", client, player);
                    continue;
                };
                let control = self
                    .rep
                    .registry
                    .get_or_create_server(world, id, id, client, None, true);
                if let Some(info) = self.rep.registry.get_mut(control) {
                    info.prepared_control.states.spawn_id = spawn_id(id, 0);
                }
            }
            log::debug!("client {} avatars allocated ({})", client, players);
            if let Some(state) = self.clients.get_mut(&client) {
                state.avatars_allocated = true;
            }
        }
    }

    fn check_timeouts(&mut self) {
        let timeout = self.rep.config().sync_timeout_ticks;
        for (&id, state) in self.clients.iter_mut() {
            if state.status >= GameStatus::Synchronizing {
                state.ticks_unsynced = 0;
                state.excluded = false;
                continue;
            }
            state.ticks_unsynced += 1;
            if state.ticks_unsynced > timeout && !state.excluded {
                log::warn!(
                    "client {} stuck in {} for {} ticks, excluded from synchronization",
                    id,
                    state.status,
                    state.ticks_unsynced
                );
                state.excluded = true;
            }
        }
    }

    fn run_barriers(&mut self) {
        let counted: Vec<GameStatus> = self
            .clients
            .values()
            .filter(|s| s.is_counted())
            .map(|s| s.status)
            .collect();

        if counted.iter().any(|&s| s < GameStatus::Synchronizing) {
            self.synchronized = false;
        }
        if counted.iter().any(|&s| s < GameStatus::Running) {
            self.all_running = false;
        }
        if self.status < GameStatus::Ready || self.status > GameStatus::Running {
            return;
        }

        if counted.is_empty() {
            if !self.allow_update {
                log::info!("no clients, free running");
                self.allow_update = true;
            }
            self.set_status(GameStatus::Running);
            return;
        }

        let need_sync = self.rep.config().need_synchronization;
        if !self.synchronized
            && (!need_sync || counted.iter().all(|&s| s >= GameStatus::Synchronizing))
        {
            log::info!("all clients synchronized");
            self.synchronized = true;
            self.broadcast(ObjectCommand::game_status(
                GameStatus::Running,
                SERVER_CLIENT_ID,
                0,
            ));
        }

        if self.synchronized
            && !self.all_running
            && counted.iter().all(|&s| s >= GameStatus::Running)
        {
            log::info!("all clients running, starting players");
            self.all_running = true;
            self.start_players();
            self.allow_update = true;
            self.set_status(GameStatus::Running);
        }
    }

    fn start_players(&mut self) {
        for (&client, state) in self.clients.iter_mut() {
            if state.is_counted() && !state.started {
                state.started = true;
                self.rep.push_event(SessionEvent::PlayersStarted { client });
            }
        }
    }

    fn serve_reborn<W: EntityWorld + ?Sized>(&mut self, world: &mut W) {
        let requests: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, s)| s.reborn_requested)
            .map(|(&id, _)| id)
            .collect();

        for client in requests {
            let owned = self.rep.owned_entities(client);
            let layout = *self.rep.registry.layout();
            let avatars: Vec<_> = owned
                .into_iter()
                .filter(|(r, _)| {
                    self.rep
                        .registry
                        .get(*r)
                        .is_some_and(|info| layout.is_avatar(info.server_node_id))
                })
                .collect();
            if avatars
                .iter()
                .any(|(r, _)| self.rep.registry.get(*r).is_some_and(|i| i.is_dying()))
            {
                continue;
            }

            for (_, entity) in &avatars {
                if let Some(entity) = entity.filter(|e| world.is_usable(*e)) {
                    world.revive(entity);
                }
            }
            let Some(state) = self.clients.get_mut(&client) else {
                continue;
            };
            state.reborn_requested = false;
            state.status = GameStatus::Running;
            let players = state.num_players;
            log::info!("client {} reborn with {} avatars", client, avatars.len());
            self.send_to(
                client,
                ObjectCommand::game_status(GameStatus::Running, client, players),
            );
            self.rep.push_event(SessionEvent::StatusChanged {
                client,
                status: GameStatus::Running,
            });
        }
    }

    fn write_controls<W: EntityWorld + ?Sized>(
        &mut self,
        world: &W,
        shared: &mut WireWriter,
        per_client: &mut BTreeMap<ClientId, WireWriter>,
    ) {
        let format = self.rep.config().wire;
        let cap = self.rep.config().max_server_controls_per_tick;
        let refs = self.rep.registry.refs(ControlTable::Server);
        if refs.is_empty() {
            return;
        }
        let start = self.cursor % refs.len();
        let mut written = 0;
        let mut visited = 0;

        while visited < refs.len() && written < cap {
            let control = refs[(start + visited) % refs.len()];
            visited += 1;

            let ready = self
                .rep
                .registry
                .get(control)
                .is_some_and(|info| info.active && info.server_node_id != 0);
            if !ready || !self.rep.prepare_control(world, control) {
                continue;
            }
            let Some(info) = self.rep.registry.get(control) else {
                continue;
            };
            let (owner, sid, cid) = (info.client_id, info.server_node_id, info.client_node_id);
            let snapshot = info.prepared_control;

            if owner == SERVER_CLIENT_ID {
                ControlRecord::full(owner, sid, 0, snapshot).write(shared, format);
            } else {
                for (&client, writer) in per_client.iter_mut() {
                    let record = if client == owner {
                        ControlRecord::ack(owner, sid, cid, snapshot)
                    } else {
                        ControlRecord::full(owner, sid, 0, snapshot)
                    };
                    record.write(writer, format);
                }
            }
            self.rep.finish_send(control);
            written += 1;
        }
        self.cursor = (start + visited) % refs.len();
    }

    /// One network update. Returns the frame for every connected client.
    pub fn tick<W: EntityWorld + ?Sized>(&mut self, world: &mut W) -> Vec<(ClientId, PeerFrame)> {
        self.tick += 1;
        self.reserve_avatars(world);
        self.allocate_avatars(world);
        self.check_timeouts();
        self.run_barriers();
        self.serve_reborn(world);

        let mut shared = WireWriter::new();
        let mut per_client: BTreeMap<ClientId, WireWriter> = self
            .clients
            .keys()
            .map(|&id| (id, WireWriter::new()))
            .collect();
        if self.status >= GameStatus::Ready {
            self.write_controls(world, &mut shared, &mut per_client);
        }

        let mut header = WireWriter::new();
        write_server_header(&mut header, self.status, self.rep.spawns.received_stamps());

        let mut frames = Vec::with_capacity(self.clients.len());
        for (&id, state) in self.clients.iter_mut() {
            let mut controls = Vec::with_capacity(header.len() + shared.len());
            controls.extend_from_slice(header.as_slice());
            controls.extend_from_slice(shared.as_slice());
            if let Some(own) = per_client.get(&id) {
                controls.extend_from_slice(own.as_slice());
            }
            let interval = self.rep.config().resend_interval(state.telemetry.rtt_ms);
            let commands = state.channel.outbox.flush(interval).unwrap_or_default();
            frames.push((
                id,
                PeerFrame {
                    command_ack: state.channel.inbox.ack(),
                    controls,
                    commands,
                },
            ));
        }

        if self.tick % PURGE_INTERVAL_TICKS == 0 {
            let keep: HashSet<ControlRef> = self.rep.spawns.mapped_controls();
            let purged = self.rep.registry.purge_inactive(&keep);
            if purged > 0 {
                log::debug!("purged {} inactive entries", purged);
            }
        }
        frames
    }
}
