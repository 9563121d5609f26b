use replica::{PacketLossSimulation, SessionConfig};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_clients: usize,
    /// Wandering server-owned entities kept alive while the game runs.
    pub wanderers: usize,
    /// Ticks a wanderer lives before it is destroyed and replaced.
    pub wanderer_lifetime: u64,
    pub ping_interval_ticks: u64,
    pub connection_timeout_secs: u64,
    pub packet_loss: Option<PacketLossSimulation>,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 8,
            wanderers: 6,
            wanderer_lifetime: 300,
            ping_interval_ticks: 15,
            connection_timeout_secs: 10,
            packet_loss: None,
            session: SessionConfig::default(),
        }
    }
}
