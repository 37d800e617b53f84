use core::time::Duration;
use serde::{Deserialize, Serialize};

/// Lower bound on how long a partial segmented message is kept.
pub const MIN_INCOMPLETE_TIMEOUT_MS: u64 = 10_000;

/// Tunables of the transport orchestrator.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
pub struct TransportConfig {
    pub incomplete_timeout_ms: u64,
    pub ack_timer_base_ms: u64,
    pub ack_timer_per_hop_ms: u64,
    pub default_ttl: u8,
    pub worker_threads: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            incomplete_timeout_ms: MIN_INCOMPLETE_TIMEOUT_MS,
            ack_timer_base_ms: 150,
            ack_timer_per_hop_ms: 50,
            default_ttl: 5,
            worker_threads: 2,
        }
    }
}

impl TransportConfig {
    pub fn with_incomplete_timeout(mut self, timeout: Duration) -> Self {
        self.incomplete_timeout_ms = (timeout.as_millis() as u64).max(MIN_INCOMPLETE_TIMEOUT_MS);
        self
    }

    pub fn with_ack_timer(mut self, base: Duration, per_hop: Duration) -> Self {
        self.ack_timer_base_ms = base.as_millis() as u64;
        self.ack_timer_per_hop_ms = per_hop.as_millis() as u64;
        self
    }

    pub fn with_default_ttl(mut self, ttl: u8) -> Self {
        self.default_ttl = ttl & 0x7F;
        self
    }

    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers.max(1);
        self
    }

    pub fn incomplete_timeout(&self) -> Duration {
        Duration::from_millis(self.incomplete_timeout_ms.max(MIN_INCOMPLETE_TIMEOUT_MS))
    }

    /// Block acknowledgement delay for a segmented message received with `ttl`.
    pub fn ack_timeout(&self, ttl: u8) -> Duration {
        Duration::from_millis(self.ack_timer_base_ms + self.ack_timer_per_hop_ms * ttl as u64)
    }
}
