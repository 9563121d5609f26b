use replica::SessionConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection_timeout_secs: u64,
    pub connect_retry_secs: f32,
    pub ping_interval_secs: f32,
    pub num_players: u32,
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 10,
            connect_retry_secs: 1.0,
            ping_interval_secs: 0.5,
            num_players: 1,
            session: SessionConfig::default(),
        }
    }
}
