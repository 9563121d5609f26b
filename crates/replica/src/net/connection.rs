use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::ids::ClientId;

use super::stats::NetworkStats;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("server full ({0} clients)")]
    Full(usize),
}

#[derive(Debug)]
pub struct ClientConnection {
    pub addr: SocketAddr,
    pub client_id: ClientId,
    pub state: ConnectionState,
    pub last_receive_time: Instant,
    pub send_sequence: u32,
    pub stats: NetworkStats,
}

impl ClientConnection {
    pub fn new(addr: SocketAddr, client_id: ClientId) -> Self {
        Self {
            addr,
            client_id,
            state: ConnectionState::Connecting,
            last_receive_time: Instant::now(),
            send_sequence: 0,
            stats: NetworkStats::default(),
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive_time.elapsed() > timeout
    }

    pub fn touch(&mut self) {
        self.last_receive_time = Instant::now();
    }

    pub fn next_sequence(&mut self) -> u32 {
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.send_sequence
    }
}

/// Client ids are the lowest free value in `1..=max_clients`; 0 is the
/// server's own id.
#[derive(Debug)]
pub struct ConnectionManager {
    clients_by_addr: HashMap<SocketAddr, ClientId>,
    clients: BTreeMap<ClientId, ClientConnection>,
    max_clients: usize,
    timeout: Duration,
}

impl ConnectionManager {
    pub fn new(max_clients: usize) -> Self {
        Self::with_timeout(max_clients, DEFAULT_TIMEOUT_SECS)
    }

    pub fn with_timeout(max_clients: usize, timeout_secs: u64) -> Self {
        Self {
            clients_by_addr: HashMap::new(),
            clients: BTreeMap::new(),
            max_clients: max_clients.min(u8::MAX as usize),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn get_or_create_pending(
        &mut self,
        addr: SocketAddr,
    ) -> Result<&mut ClientConnection, ConnectionError> {
        let client_id = match self.clients_by_addr.get(&addr) {
            Some(&id) => id,
            None => {
                let id = (1..=self.max_clients as u8)
                    .find(|id| !self.clients.contains_key(id))
                    .ok_or(ConnectionError::Full(self.max_clients))?;
                self.clients.insert(id, ClientConnection::new(addr, id));
                self.clients_by_addr.insert(addr, id);
                id
            }
        };
        self.clients
            .get_mut(&client_id)
            .ok_or(ConnectionError::Full(self.max_clients))
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&ClientConnection> {
        self.clients_by_addr
            .get(addr)
            .and_then(|id| self.clients.get(id))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut ClientConnection> {
        let id = *self.clients_by_addr.get(addr)?;
        self.clients.get_mut(&id)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&ClientConnection> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Option<&mut ClientConnection> {
        self.clients.get_mut(&client_id)
    }

    pub fn remove(&mut self, client_id: ClientId) -> Option<ClientConnection> {
        let conn = self.clients.remove(&client_id)?;
        self.clients_by_addr.remove(&conn.addr);
        Some(conn)
    }

    pub fn remove_by_addr(&mut self, addr: &SocketAddr) -> Option<ClientConnection> {
        let client_id = self.clients_by_addr.remove(addr)?;
        self.clients.remove(&client_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientConnection> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientConnection> {
        self.clients.values_mut()
    }

    pub fn cleanup_timed_out(&mut self) -> Vec<ClientId> {
        let timed_out: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.is_timed_out(self.timeout))
            .map(|(&id, _)| id)
            .collect();

        for id in &timed_out {
            self.remove(*id);
        }

        timed_out
    }

    pub fn connected_count(&self) -> usize {
        self.clients
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.clients.len()
    }
}
