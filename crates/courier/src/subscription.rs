//! Topic subscription table.
//!
//! Each topic owns an immutable [`Subscription`] snapshot behind an `Arc`.
//! `subscribe` swaps in a new snapshot under the shard lock of the
//! `DashMap`; dispatch clones the `Arc` and releases the lock right away, so
//! handlers never run while the table is locked and late subscriptions never
//! race with in-flight reads.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use smallvec::SmallVec;

use crate::handler::EventHandler;

pub(crate) type Handlers = SmallVec<[Arc<dyn EventHandler>; 2]>;

/// Handlers and retry delays registered for one topic.
#[derive(Clone, Default)]
pub struct Subscription {
    handlers: Handlers,
    delays: Vec<Duration>,
}

impl Subscription {
    pub fn handlers(&self) -> &[Arc<dyn EventHandler>] {
        &self.handlers
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Number of retries the delay schedule allows.
    pub fn max_retries(&self) -> u32 {
        u32::try_from(self.delays.len()).unwrap_or(u32::MAX)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        let index = usize::try_from(attempt.checked_sub(1)?).ok()?;
        self.delays.get(index).copied()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("handlers", &self.handlers.len())
            .field("delays", &self.delays)
            .finish()
    }
}

/// What changed when a handler was registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SubscribeOutcome {
    pub handler_count: usize,
    /// The schedule that was overwritten, when it differed from the new one.
    pub replaced_delays: Option<Vec<Duration>>,
}

/// Scale raw delay values by `unit`, saturating instead of overflowing.
pub fn scale_delays(delays: &[u32], unit: Duration) -> Vec<Duration> {
    delays
        .iter()
        .map(|&delay| unit.checked_mul(delay).unwrap_or(Duration::MAX))
        .collect()
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    topics: DashMap<String, Arc<Subscription>>,
}

impl SubscriptionTable {
    /// Append `handler` to `topic` and replace the topic's delay schedule.
    pub fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        delays: Vec<Duration>,
    ) -> SubscribeOutcome {
        let mut entry = self.topics.entry(topic.to_string()).or_default();

        let mut next = Subscription::clone(entry.value());
        next.handlers.push(handler);

        let replaced_delays = if next.handlers.len() > 1 && next.delays != delays {
            Some(std::mem::replace(&mut next.delays, delays))
        } else {
            next.delays = delays;
            None
        };

        let outcome = SubscribeOutcome {
            handler_count: next.handlers.len(),
            replaced_delays,
        };
        *entry.value_mut() = Arc::new(next);
        outcome
    }

    pub fn get(&self, topic: &str) -> Option<Arc<Subscription>> {
        self.topics.get(topic).map(|entry| Arc::clone(entry.value()))
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.iter().map(|entry| entry.key().clone()).collect();
        topics.sort();
        topics
    }
}
