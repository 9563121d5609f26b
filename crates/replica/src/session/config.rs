use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::IdLayout;
use crate::wire::WireFormat;

/// What the server does with a client position that moved further than
/// `position_tolerance` since the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PositionPolicy {
    #[default]
    LogOnly,
    Clamp,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub update_fps: u32,
    pub max_server_controls_per_tick: usize,
    pub max_client_controls_per_tick: usize,
    pub command_resend_ticks: u32,
    pub max_retained_command_packets: usize,
    pub sent_history_len: usize,
    pub sync_timeout_ticks: u32,
    pub players_per_client: u32,
    pub max_net_players: u32,
    pub position_tolerance: f32,
    pub reconcile_threshold: f32,
    pub damage_epsilon: f32,
    pub wire: WireFormat,
    pub need_synchronization: bool,
    pub server_reconciliation: bool,
    pub position_policy: PositionPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            update_fps: 15,
            max_server_controls_per_tick: 60,
            max_client_controls_per_tick: 20,
            command_resend_ticks: 10,
            max_retained_command_packets: 128,
            sent_history_len: 32,
            sync_timeout_ticks: 375,
            players_per_client: 4,
            max_net_players: 64,
            position_tolerance: 1.0,
            reconcile_threshold: 0.1,
            damage_epsilon: 0.01,
            wire: WireFormat::Packed,
            need_synchronization: true,
            server_reconciliation: false,
            position_policy: PositionPolicy::LogOnly,
        }
    }
}

impl SessionConfig {
    pub fn id_layout(&self) -> IdLayout {
        IdLayout {
            players_per_client: self.players_per_client,
            max_net_players: self.max_net_players,
            ..IdLayout::default()
        }
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.update_fps.max(1) as f64)
    }

    /// Resend interval in ticks for a peer with the given round trip.
    pub fn resend_interval(&self, rtt_ms: f32) -> u32 {
        let tick_ms = self.tick_duration().as_secs_f32() * 1000.0;
        let rtt_ticks = if rtt_ms > 0.0 {
            (rtt_ms / tick_ms).ceil() as u32
        } else {
            0
        };
        self.command_resend_ticks.max(rtt_ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resend_interval_follows_slow_peers() {
        let config = SessionConfig::default();
        assert_eq!(config.resend_interval(0.0), 10);
        assert_eq!(config.resend_interval(200.0), 10);
        assert_eq!(config.resend_interval(950.0), 15);
    }

    #[test]
    fn layout_follows_player_counts() {
        let config = SessionConfig {
            players_per_client: 2,
            max_net_players: 8,
            ..Default::default()
        };
        assert_eq!(config.id_layout().avatar_count(), 16);
    }
}
