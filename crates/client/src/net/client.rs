use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use replica::{
    ClientId, ClientSession, ConnectionState, GameStatus, NetworkEndpoint, NetworkStats, Packet,
    PacketHeader, PacketType, PeerFrame, SceneWorld, SessionEvent,
};

use super::config::ClientConfig;

/// UDP link to one server plus the client side of the replication session.
pub struct NetworkClient {
    endpoint: NetworkEndpoint,
    config: ClientConfig,
    state: ConnectionState,
    session: Option<ClientSession>,
    send_sequence: u32,
    tick_duration: Duration,
    accumulator: Duration,
    last_update: Instant,
    last_ping_time: Instant,
    last_request_time: Instant,
    connection_start_time: Option<Instant>,
    killed: bool,
}

impl NetworkClient {
    pub fn new(config: ClientConfig) -> io::Result<Self> {
        let mut endpoint = NetworkEndpoint::bind("0.0.0.0:0")?;
        endpoint.set_timeout(Duration::from_secs(config.connection_timeout_secs));

        Ok(Self {
            endpoint,
            state: ConnectionState::Disconnected,
            session: None,
            send_sequence: 0,
            tick_duration: config.session.tick_duration(),
            accumulator: Duration::ZERO,
            last_update: Instant::now(),
            last_ping_time: Instant::now(),
            last_request_time: Instant::now(),
            connection_start_time: None,
            killed: false,
            config,
        })
    }

    pub fn endpoint_mut(&mut self) -> &mut NetworkEndpoint {
        &mut self.endpoint
    }

    pub fn connect(&mut self, server_addr: SocketAddr) -> io::Result<()> {
        log::info!("Connecting to {}", server_addr);

        self.endpoint.set_remote(server_addr);
        self.state = ConnectionState::Connecting;
        self.connection_start_time = Some(Instant::now());
        self.killed = false;

        self.send_connection_request()
    }

    pub fn disconnect(&mut self, world: &mut SceneWorld) {
        if self.state == ConnectionState::Connected {
            let _ = self.send_payload(PacketType::Disconnect);
        }
        if let Some(session) = self.session.as_mut() {
            session.disconnect(world);
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.endpoint.reset();
        self.connection_start_time = None;
        self.accumulator = Duration::ZERO;
    }

    fn next_header(&mut self) -> PacketHeader {
        self.send_sequence = self.send_sequence.wrapping_add(1);
        PacketHeader::new(self.send_sequence)
    }

    fn send_payload(&mut self, payload: PacketType) -> io::Result<usize> {
        let packet = Packet::new(self.next_header(), payload);
        self.endpoint.send(&packet)
    }

    fn send_connection_request(&mut self) -> io::Result<()> {
        self.last_request_time = Instant::now();
        self.send_payload(PacketType::ConnectionRequest)?;
        Ok(())
    }

    /// Polls the socket and runs due network ticks. Returns the number of
    /// ticks run so the caller can step its own simulation in lockstep.
    pub fn update(&mut self, world: &mut SceneWorld) -> io::Result<u32> {
        self.process_network(world)?;

        let now = Instant::now();
        let delta = now - self.last_update;
        self.last_update = now;

        match self.state {
            ConnectionState::Connecting => {
                if let Some(start) = self.connection_start_time {
                    if start.elapsed() > Duration::from_secs(self.config.connection_timeout_secs) {
                        log::warn!("Connection timeout");
                        self.reset();
                        return Ok(0);
                    }
                }
                if self.last_request_time.elapsed().as_secs_f32() >= self.config.connect_retry_secs {
                    self.send_connection_request()?;
                }
                Ok(0)
            }
            ConnectionState::Connected => {
                if self.last_ping_time.elapsed().as_secs_f32() >= self.config.ping_interval_secs {
                    let timestamp = self.endpoint.now_ms();
                    self.send_payload(PacketType::Ping { timestamp })?;
                    self.last_ping_time = Instant::now();
                }

                if self.endpoint.is_timed_out() {
                    log::warn!("Server connection lost");
                    if let Some(session) = self.session.as_mut() {
                        session.disconnect(world);
                    }
                    self.reset();
                    return Ok(0);
                }

                self.accumulator += delta;
                let mut ticks = 0;
                while self.accumulator >= self.tick_duration {
                    self.accumulator -= self.tick_duration;
                    self.network_tick(world)?;
                    ticks += 1;
                }
                Ok(ticks)
            }
            ConnectionState::Disconnected => {
                // Solo play after a fallback still needs ticks.
                self.accumulator += delta;
                let mut ticks = 0;
                while self.accumulator >= self.tick_duration {
                    self.accumulator -= self.tick_duration;
                    ticks += 1;
                }
                Ok(ticks)
            }
        }
    }

    fn network_tick(&mut self, world: &mut SceneWorld) -> io::Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let frame = session.tick(world);
        self.handle_session_events();

        if let Some(frame) = frame {
            self.send_payload(PacketType::Frame(frame))?;
        }
        Ok(())
    }

    fn handle_session_events(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let own = session.client_id();
        for event in session.drain_events() {
            match event {
                SessionEvent::StatusChanged { client, status } if client == own => {
                    log::info!("Status {}", status);
                }
                SessionEvent::StatusChanged { status, .. } => {
                    log::debug!("Server status {}", status);
                }
                SessionEvent::Disconnected { client } if client == own => {
                    log::info!("Server ended the session");
                    self.killed = true;
                }
                SessionEvent::FallbackToLocal => {
                    log::warn!("No synchronization with the server, continuing alone");
                    self.state = ConnectionState::Disconnected;
                }
                SessionEvent::EntitySpawned { id, owner } => {
                    log::debug!("Entity {} spawned (owner {})", id, owner);
                }
                SessionEvent::EntityDestroyed { id } => {
                    log::debug!("Entity {} destroyed", id);
                }
                SessionEvent::Command { from, command } => {
                    log::debug!("Command {:?} from {}", command.kind, from);
                }
                SessionEvent::Disconnected { .. } | SessionEvent::PlayersStarted { .. } => {}
            }
        }
    }

    fn process_network(&mut self, world: &mut SceneWorld) -> io::Result<()> {
        let packets = self.endpoint.receive()?;

        for (packet, addr) in packets {
            if Some(addr) != self.endpoint.remote_addr() {
                log::debug!("Ignoring packet from {}", addr);
                continue;
            }
            self.handle_payload(world, packet.payload)?;
        }
        self.handle_session_events();

        Ok(())
    }

    fn handle_payload(&mut self, world: &mut SceneWorld, payload: PacketType) -> io::Result<()> {
        match payload {
            PacketType::ConnectionAccepted { client_id } => {
                self.handle_connection_accepted(client_id);
            }
            PacketType::ConnectionDenied { reason } => {
                log::warn!("Connection denied: {}", reason);
                self.reset();
            }
            PacketType::Frame(frame) => {
                self.handle_frame(world, &frame);
            }
            PacketType::Ping { timestamp } => {
                self.send_payload(PacketType::Pong { timestamp })?;
            }
            PacketType::Pong { timestamp } => {
                let rtt = self.endpoint.now_ms().saturating_sub(timestamp);
                log::trace!("Ping RTT: {} ms", rtt);
                self.endpoint.record_rtt(rtt as f32);
                let telemetry = self.endpoint.stats().telemetry();
                if let Some(session) = self.session.as_mut() {
                    session.set_telemetry(telemetry);
                }
            }
            PacketType::Disconnect => {
                log::info!("Disconnected by server");
                if let Some(session) = self.session.as_mut() {
                    session.disconnect(world);
                }
                self.killed = true;
                self.reset();
            }
            PacketType::ConnectionRequest => {}
        }

        Ok(())
    }

    fn handle_connection_accepted(&mut self, client_id: ClientId) {
        if self.state == ConnectionState::Connected {
            return;
        }
        log::info!("Connected to server with client ID {}", client_id);

        let mut session = ClientSession::new(client_id, self.config.session.clone());
        session.connect(self.config.num_players);
        self.session = Some(session);
        self.state = ConnectionState::Connected;
        self.endpoint.set_state(ConnectionState::Connected);
        self.last_update = Instant::now();
        self.accumulator = Duration::ZERO;
    }

    fn handle_frame(&mut self, world: &mut SceneWorld, frame: &PeerFrame) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.receive(world, frame);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// True once the server killed or closed the session.
    pub fn is_finished(&self) -> bool {
        self.killed
    }

    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut ClientSession> {
        self.session.as_mut()
    }

    pub fn status(&self) -> GameStatus {
        self.session.as_ref().map_or(GameStatus::Menu, |s| s.status())
    }

    pub fn stats(&self) -> &NetworkStats {
        self.endpoint.stats()
    }
}
