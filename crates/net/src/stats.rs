/// Aggregate traffic counters for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reliable_resends: u64,
    pub decode_errors: u64,
    pub stale_updates_dropped: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
}

/// Artificial packet drop applied to outbound traffic, for soak-testing the
/// retransmission path without a lossy network.
#[derive(Debug, Clone, Default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
}

impl PacketLossSimulation {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_percent() * 100.0 < self.loss_percent
    }
}

pub fn rand_percent() -> f32 {
    (rand_u64() % 10_000) as f32 / 10_000.0
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_sim_never_drops() {
        let sim = PacketLossSimulation::default();
        for _ in 0..100 {
            assert!(!sim.should_drop());
        }
    }

    #[test]
    fn test_full_loss_always_drops() {
        let sim = PacketLossSimulation {
            enabled: true,
            loss_percent: 100.0,
        };
        for _ in 0..100 {
            assert!(sim.should_drop());
        }
    }
}
