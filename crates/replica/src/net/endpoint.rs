use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use super::connection::ConnectionState;
use super::protocol::{MAX_PACKET_SIZE, Packet};
use super::stats::{NetworkStats, PacketLossSimulation};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Non-blocking UDP socket carrying rkyv packets.
pub struct NetworkEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    state: ConnectionState,
    stats: NetworkStats,
    loss_sim: PacketLossSimulation,
    recv_buffer: Vec<u8>,
    timeout: Duration,
    started: Instant,
    last_receive_time: Instant,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            remote_addr: None,
            state: ConnectionState::Disconnected,
            stats: NetworkStats::default(),
            loss_sim: PacketLossSimulation::default(),
            recv_buffer: vec![0u8; MAX_PACKET_SIZE],
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            started: Instant::now(),
            last_receive_time: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn set_remote(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Feeds a pong round trip into the smoothed RTT.
    pub fn record_rtt(&mut self, rtt_ms: f32) {
        self.stats.record_rtt(rtt_ms);
    }

    pub fn set_loss_simulation(&mut self, sim: PacketLossSimulation) {
        self.loss_sim = sim;
    }

    /// Milliseconds since the endpoint was bound, used for ping stamps.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn send_to(&mut self, packet: &Packet, addr: SocketAddr) -> io::Result<usize> {
        let data = packet.serialize().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Serialization error: {}", e),
            )
        })?;

        if data.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Packet of {} bytes exceeds {}", data.len(), MAX_PACKET_SIZE),
            ));
        }

        if self.loss_sim.should_drop() {
            log::trace!("simulated loss of packet {}", packet.header.sequence);
            self.stats.record_sent(data.len());
            return Ok(data.len());
        }

        let bytes = self.socket.send_to(&data, addr)?;
        self.stats.record_sent(bytes);

        Ok(bytes)
    }

    pub fn send(&mut self, packet: &Packet) -> io::Result<usize> {
        let addr = self
            .remote_addr
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "No remote address set"))?;
        self.send_to(packet, addr)
    }

    /// Drains the socket. Datagrams that fail validation are dropped.
    pub fn receive(&mut self) -> io::Result<Vec<(Packet, SocketAddr)>> {
        let mut packets = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    if size < 8 {
                        continue;
                    }

                    match Packet::deserialize(&self.recv_buffer[..size]) {
                        Ok(packet) => {
                            if !packet.header.is_valid() {
                                log::debug!("bad header from {}", addr);
                                continue;
                            }

                            if self.remote_addr == Some(addr) {
                                self.stats.record_received(packet.header.sequence, size);
                            }
                            self.last_receive_time = Instant::now();
                            packets.push((packet, addr));
                        }
                        Err(e) => log::debug!("undecodable datagram from {}: {}", addr, e),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(packets)
    }

    pub fn is_timed_out(&self) -> bool {
        self.last_receive_time.elapsed() > self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.stats = NetworkStats::default();
        self.last_receive_time = Instant::now();
    }
}
