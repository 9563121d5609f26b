use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use glam::Vec2;

use replica::{
    ClientId, ConnectionManager, ConnectionState, EntityHandle, GameStatus, NetworkEndpoint,
    NetworkStats, NodeId, Packet, PacketHeader, PacketType, PeerFrame, SceneEntity, SceneWorld,
    ServerSession, SessionEvent,
};

use crate::config::ServerConfig;
use crate::events::{DisconnectReason, ServerEvent};

const WANDERER_KIND: u32 = 0x5741_4E44;
const WANDERER_LIFE: f32 = 100.0;

#[derive(Debug)]
struct Wanderer {
    id: NodeId,
    handle: EntityHandle,
    born: u64,
    phase: f32,
}

pub struct GameServer {
    endpoint: NetworkEndpoint,
    connections: ConnectionManager,
    config: ServerConfig,
    session: ServerSession,
    world: SceneWorld,
    wanderers: Vec<Wanderer>,
    tick: u64,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    pending_events: VecDeque<ServerEvent>,
}

impl GameServer {
    pub fn new(bind_addr: &str, config: ServerConfig) -> io::Result<Self> {
        let mut endpoint = NetworkEndpoint::bind(bind_addr)?;
        if let Some(sim) = config.packet_loss.clone() {
            endpoint.set_loss_simulation(sim);
        }
        let tick_duration = config.session.tick_duration();

        let mut session = ServerSession::new(config.session.clone());
        session.set_status(GameStatus::Ready);

        Ok(Self {
            endpoint,
            connections: ConnectionManager::with_timeout(
                config.max_clients,
                config.connection_timeout_secs,
            ),
            session,
            world: SceneWorld::new().with_spawn_life(WANDERER_LIFE),
            wanderers: Vec::new(),
            tick: 0,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            pending_events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn run(&mut self, max_ticks: Option<u64>) {
        while max_ticks.is_none_or(|max| self.tick < max) {
            self.tick_once();
            for event in self.pending_events.drain(..) {
                log_event(&event);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown_connections();
    }

    pub fn shutdown_connections(&mut self) {
        self.session.kill_clients();
        self.flush_frames();

        let client_ids: Vec<ClientId> = self.connections.iter().map(|c| c.client_id).collect();
        for client_id in client_ids {
            self.kick_client(client_id);
        }
    }

    pub fn kick_client(&mut self, client_id: ClientId) {
        if let Some(client) = self.connections.get(client_id) {
            let addr = client.addr;
            let packet = Packet::new(PacketHeader::new(0), PacketType::Disconnect);
            let _ = self.endpoint.send_to(&packet, addr);
        }

        if self.connections.remove(client_id).is_some() {
            self.session.remove_client(&mut self.world, client_id);
            self.pending_events.push_back(ServerEvent::ClientDisconnected {
                client_id,
                reason: DisconnectReason::Kicked,
            });
        }
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;
        self.accumulator += delta;

        if let Err(e) = self.process_network() {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("Network error: {}", e),
            });
        }

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick();
        }
    }

    fn tick(&mut self) {
        self.tick += 1;

        if self.session.allow_update() || self.session.status() == GameStatus::Running {
            self.simulate();
        }

        self.flush_frames();
        self.handle_session_events();

        if self.tick % self.config.ping_interval_ticks.max(1) == 0 {
            self.send_pings();
        }

        let timed_out = self.connections.cleanup_timed_out();
        for client_id in timed_out {
            self.session.remove_client(&mut self.world, client_id);
            self.pending_events.push_back(ServerEvent::ClientDisconnected {
                client_id,
                reason: DisconnectReason::Timeout,
            });
        }
    }

    /// Moves wanderers on circles and replaces them when they expire.
    fn simulate(&mut self) {
        let dt = self.tick_duration.as_secs_f32();

        let mut expired = Vec::new();
        for wanderer in &mut self.wanderers {
            let age = self.tick - wanderer.born;
            if age > self.config.wanderer_lifetime {
                expired.push(wanderer.id);
                continue;
            }
            wanderer.phase += dt;
            if let Some(entity) = self.world.get_mut(wanderer.handle) {
                let previous = entity.physics.position;
                let center = Vec2::new(wanderer.phase.cos(), wanderer.phase.sin()) * 4.0;
                entity.physics.position = center;
                entity.physics.velocity = (center - previous) / dt.max(f32::EPSILON);
                entity.physics.direction = wanderer.phase;
            }
        }

        for id in expired {
            log::debug!("wanderer {} expired", id);
            self.session.destroy(&mut self.world, id);
            self.wanderers.retain(|w| w.id != id);
        }

        while self.wanderers.len() < self.config.wanderers {
            let phase = self.wanderers.len() as f32 * 1.3 + self.tick as f32 * 0.01;
            let entity = SceneEntity::new(0, WANDERER_KIND)
                .with_position(Vec2::new(phase.cos(), phase.sin()) * 4.0)
                .with_vitals(WANDERER_LIFE);
            let handle = self.world.insert(entity);
            let Some(id) = self.world.get(handle).map(|e| e.id) else {
                break;
            };
            if self.session.spawn(&mut self.world, handle, None, true).is_none() {
                log::warn!("wanderer {} could not be replicated", id);
                break;
            }
            self.wanderers.push(Wanderer {
                id,
                handle,
                born: self.tick,
                phase,
            });
        }
    }

    fn flush_frames(&mut self) {
        let frames = self.session.tick(&mut self.world);
        for (client_id, frame) in frames {
            self.send_frame(client_id, frame);
        }
    }

    fn send_frame(&mut self, client_id: ClientId, frame: PeerFrame) {
        let Some(client) = self.connections.get_mut(client_id) else {
            return;
        };
        if client.state != ConnectionState::Connected {
            return;
        }
        let addr = client.addr;
        let header = PacketHeader::new(client.next_sequence());
        let packet = Packet::new(header, PacketType::Frame(frame));

        if let Err(e) = self.endpoint.send_to(&packet, addr) {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("Failed to send frame to {}: {}", addr, e),
            });
        }
    }

    fn send_pings(&mut self) {
        let timestamp = self.endpoint.now_ms();
        let targets: Vec<SocketAddr> = self
            .connections
            .iter()
            .filter(|c| c.state == ConnectionState::Connected)
            .map(|c| c.addr)
            .collect();
        for addr in targets {
            let packet = Packet::new(PacketHeader::new(0), PacketType::Ping { timestamp });
            if let Err(e) = self.endpoint.send_to(&packet, addr) {
                log::debug!("ping to {} failed: {}", addr, e);
            }
        }
    }

    fn handle_session_events(&mut self) {
        for event in self.session.drain_events() {
            match event {
                SessionEvent::StatusChanged { client, status } => {
                    log::info!("status: client {} -> {}", client, status);
                }
                SessionEvent::PlayersStarted { client } => {
                    log::info!("client {} players started", client);
                }
                SessionEvent::EntitySpawned { id, owner } => {
                    log::debug!("entity {} spawned for client {}", id, owner);
                }
                SessionEvent::EntityDestroyed { id } => {
                    self.wanderers.retain(|w| w.id != id);
                    log::debug!("entity {} destroyed", id);
                }
                SessionEvent::Command { from, command } => {
                    log::debug!("command {:?} from client {}", command.kind, from);
                }
                SessionEvent::Disconnected { client } => {
                    log::info!("client {} left the session", client);
                }
                SessionEvent::FallbackToLocal => {}
            }
        }
    }

    fn process_network(&mut self) -> io::Result<()> {
        let packets = self.endpoint.receive()?;

        for (packet, addr) in packets {
            self.handle_packet(packet, addr)?;
        }

        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) -> io::Result<()> {
        let sequence = packet.header.sequence;
        match packet.payload {
            PacketType::ConnectionRequest => {
                self.handle_connection_request(addr)?;
            }
            PacketType::Frame(frame) => {
                self.handle_frame(addr, sequence, frame);
            }
            PacketType::Ping { timestamp } => {
                let packet = Packet::new(PacketHeader::new(0), PacketType::Pong { timestamp });
                self.endpoint.send_to(&packet, addr)?;
            }
            PacketType::Pong { timestamp } => {
                self.handle_pong(addr, timestamp);
            }
            PacketType::Disconnect => {
                self.handle_disconnect(addr);
            }
            _ => {}
        }

        if let Some(client) = self.connections.get_by_addr_mut(&addr) {
            client.touch();
        }

        Ok(())
    }

    fn handle_connection_request(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.pending_events.push_back(ServerEvent::ClientConnecting { addr });

        let client = match self.connections.get_or_create_pending(addr) {
            Ok(c) => c,
            Err(reason) => {
                let packet = Packet::new(
                    PacketHeader::new(0),
                    PacketType::ConnectionDenied {
                        reason: reason.to_string(),
                    },
                );
                self.endpoint.send_to(&packet, addr)?;
                self.pending_events.push_back(ServerEvent::ConnectionDenied {
                    addr,
                    reason: reason.to_string(),
                });
                return Ok(());
            }
        };

        let newly_connected = client.state != ConnectionState::Connected;
        client.state = ConnectionState::Connected;
        let client_id = client.client_id;
        let header = PacketHeader::new(client.next_sequence());

        if newly_connected {
            self.session.add_client(client_id);
            self.pending_events
                .push_back(ServerEvent::ClientConnected { client_id, addr });
        }

        let packet = Packet::new(header, PacketType::ConnectionAccepted { client_id });
        self.endpoint.send_to(&packet, addr)?;

        Ok(())
    }

    fn handle_frame(&mut self, addr: SocketAddr, sequence: u32, frame: PeerFrame) {
        let Some(client) = self.connections.get_by_addr_mut(&addr) else {
            return;
        };
        if client.state != ConnectionState::Connected {
            return;
        }
        client
            .stats
            .record_received(sequence, frame.controls.len() + frame.commands.len());
        let client_id = client.client_id;
        self.session.receive(&mut self.world, client_id, &frame);
    }

    fn handle_pong(&mut self, addr: SocketAddr, timestamp: u64) {
        let now = self.endpoint.now_ms();
        let Some(client) = self.connections.get_by_addr_mut(&addr) else {
            return;
        };
        client.stats.record_rtt(now.saturating_sub(timestamp) as f32);
        let (client_id, telemetry) = (client.client_id, client.stats.telemetry());
        self.session.set_telemetry(client_id, telemetry);
    }

    fn handle_disconnect(&mut self, addr: SocketAddr) {
        if let Some(client) = self.connections.remove_by_addr(&addr) {
            self.session.remove_client(&mut self.world, client.client_id);
            self.pending_events.push_back(ServerEvent::ClientDisconnected {
                client_id: client.client_id,
                reason: DisconnectReason::Graceful,
            });
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            tick: self.tick,
            status: self.session.status(),
            client_count: self.connections.connected_count(),
            max_clients: self.config.max_clients,
            entity_count: self.world.entity_count(),
            network_stats: self.endpoint.stats().clone(),
        }
    }
}

pub fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ClientConnecting { addr } => log::debug!("Connection request from {}", addr),
        ServerEvent::ClientConnected { client_id, addr } => {
            log::info!("Client {} connected from {}", client_id, addr)
        }
        ServerEvent::ClientDisconnected { client_id, reason } => {
            log::info!("Client {} {}", client_id, reason.as_str())
        }
        ServerEvent::ConnectionDenied { addr, reason } => {
            log::warn!("Connection denied to {}: {}", addr, reason)
        }
        ServerEvent::Error { message } => log::error!("{}", message),
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub tick: u64,
    pub status: GameStatus,
    pub client_count: usize,
    pub max_clients: usize,
    pub entity_count: usize,
    pub network_stats: NetworkStats,
}
