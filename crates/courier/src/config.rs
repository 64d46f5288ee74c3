//! Bus configuration.

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Queue capacity used when nothing else is configured.
pub const DEFAULT_CAPACITY: usize = 100;

/// Tunables for an [`EventBus`](crate::EventBus).
///
/// Deserializable so applications can keep it next to the rest of their
/// configuration:
///
/// ```toml
/// [event_bus]
/// capacity = 512
/// recover_on_start = true
/// final_ack_processed = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bounded queue size. Publishers wait when it is full.
    pub capacity: usize,
    /// Replay pending outbox records when processing starts.
    pub recover_on_start: bool,
    /// Record an event that every handler acknowledged on its last
    /// scheduled attempt as processed. Off by default: the last attempt is
    /// terminal and marks the record failed whatever the handlers returned.
    pub final_ack_processed: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            recover_on_start: true,
            final_ack_processed: false,
        }
    }
}

impl BusConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Capacity actually used for the channel. tokio rejects zero and
    /// anything above the semaphore permit limit.
    pub(crate) fn effective_capacity(&self) -> usize {
        self.capacity.clamp(1, Semaphore::MAX_PERMITS)
    }
}
