use crate::session::PeerTelemetry;

use super::protocol::sequence_greater_than;

#[derive(Debug, Clone, Default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
}

impl PacketLossSimulation {
    pub fn new(loss_percent: f32) -> Self {
        Self {
            enabled: loss_percent > 0.0,
            loss_percent,
        }
    }

    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        if self.loss_percent >= 100.0 {
            return true;
        }
        rand_percent() * 100.0 < self.loss_percent
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
    pub packet_loss_percent: f32,
    last_sequence: Option<u32>,
}

impl NetworkStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Counts a received packet. Gaps in the sequence count as lost until a
    /// late packet fills them.
    pub fn record_received(&mut self, sequence: u32, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;

        match self.last_sequence {
            Some(last) if sequence_greater_than(sequence, last) => {
                self.packets_lost += u64::from(sequence.wrapping_sub(last) - 1);
                self.last_sequence = Some(sequence);
            }
            Some(last) if sequence != last => {
                self.packets_lost = self.packets_lost.saturating_sub(1);
            }
            Some(_) => {}
            None => self.last_sequence = Some(sequence),
        }

        let expected = self.packets_received + self.packets_lost;
        self.packet_loss_percent = if expected == 0 {
            0.0
        } else {
            self.packets_lost as f32 / expected as f32 * 100.0
        };
    }

    pub fn record_rtt(&mut self, sample_ms: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        if self.rtt_ms == 0.0 {
            self.rtt_ms = sample_ms;
            self.rtt_variance = sample_ms / 2.0;
            return;
        }
        let diff = (sample_ms - self.rtt_ms).abs();
        self.rtt_variance = (1.0 - BETA) * self.rtt_variance + BETA * diff;
        self.rtt_ms = (1.0 - ALPHA) * self.rtt_ms + ALPHA * sample_ms;
    }

    pub fn telemetry(&self) -> PeerTelemetry {
        PeerTelemetry {
            rtt_ms: self.rtt_ms,
            packet_loss: self.packet_loss_percent / 100.0,
        }
    }
}

pub fn rand_percent() -> f32 {
    rand_u64() as f32 / u64::MAX as f32
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    hasher.finish()
}
