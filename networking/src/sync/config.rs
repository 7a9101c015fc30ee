/// Catch-up configuration.
///
/// Operational parameters for block catch-up: batch sizes, timeouts, queue
/// capacities and peer capacity tokens.
use std::time::Duration;

use containers::Bytes32;
use serde::Deserialize;

/// Batch size each peer starts with.
pub const INITIAL_BATCH_SIZE: usize = 100;

/// Adaptive batching never shrinks a batch below this.
pub const MIN_BATCH_SIZE: usize = 1;

/// Adaptive batching never grows a batch above this.
pub const MAX_BATCH_SIZE: usize = 500;

/// Peer capacity tokens seeded into each peer's fetch loop.
pub const TOKENS_PER_PEER: usize = 2;

/// Pause before assembling a batch so the scheduler can accumulate work.
pub const BATCH_GRACE_MS: u64 = 5_000;

/// How long a batch may wait for its blocks before survivors are requeued.
pub const BATCH_TIMEOUT_MS: u64 = 30_000;

/// A batch fully delivered faster than this grows the next batch.
pub const BATCH_TARGET_LATENCY_MS: u64 = 2_000;

/// Input capacity of the fetch request factory.
pub const FACTORY_QUEUE_CAPACITY: usize = 2;

/// Input capacity of the completion waiter; bounds blocks in flight.
pub const WAITER_QUEUE_CAPACITY: usize = 100;

/// Blocks below this height are never requested.
pub const MIN_FETCH_HEIGHT: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatchupConfig {
    pub initial_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub tokens_per_peer: usize,
    pub batch_grace_ms: u64,
    /// `None` waits for a batch indefinitely.
    pub batch_timeout_ms: Option<u64>,
    pub batch_target_latency_ms: u64,
    pub factory_queue_capacity: usize,
    pub waiter_queue_capacity: usize,
    pub min_height: u64,
    /// Hex hash sent as `hash_stop` in `getheaders`; zero asks for as many
    /// headers as the peer will send.
    #[serde(with = "hash_stop_hex")]
    pub hash_stop: Bytes32,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: INITIAL_BATCH_SIZE,
            min_batch_size: MIN_BATCH_SIZE,
            max_batch_size: MAX_BATCH_SIZE,
            tokens_per_peer: TOKENS_PER_PEER,
            batch_grace_ms: BATCH_GRACE_MS,
            batch_timeout_ms: Some(BATCH_TIMEOUT_MS),
            batch_target_latency_ms: BATCH_TARGET_LATENCY_MS,
            factory_queue_capacity: FACTORY_QUEUE_CAPACITY,
            waiter_queue_capacity: WAITER_QUEUE_CAPACITY,
            min_height: MIN_FETCH_HEIGHT,
            hash_stop: Bytes32::ZERO,
        }
    }
}

impl CatchupConfig {
    pub fn batch_grace(&self) -> Duration {
        Duration::from_millis(self.batch_grace_ms)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_ms.map(Duration::from_millis)
    }

    pub fn batch_target_latency(&self) -> Duration {
        Duration::from_millis(self.batch_target_latency_ms)
    }

    /// Batch size after a round that took `elapsed` and left `undelivered`
    /// members unresolved.
    pub fn next_batch_size(&self, current: usize, elapsed: Duration, undelivered: usize) -> usize {
        let next = if undelivered > 0 {
            current / 2
        } else if elapsed <= self.batch_target_latency() {
            current.saturating_mul(2)
        } else {
            current
        };
        let max = self.max_batch_size.max(1);
        next.clamp(self.min_batch_size.clamp(1, max), max)
    }
}

mod hash_stop_hex {
    use containers::Bytes32;
    use serde::{Deserialize, Deserializer, de::Error};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes32, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}
