//! Durable outbox interface consumed by the bus.
//!
//! The bus only needs five operations from a store: upsert, bulk load of
//! pending records, status update, and the two terminal transitions. Any
//! transaction handling lives inside the store implementation.
//!
//! # Record layout
//!
//! | column       | meaning                                   |
//! |--------------|-------------------------------------------|
//! | `id`         | primary key, becomes [`Event::id`]        |
//! | `data`       | opaque payload                            |
//! | `topic`      | routing key                               |
//! | `retry`      | attempts already made                     |
//! | `next_retry` | delay before next attempt, whole minutes  |
//! | `ack_status` | `NACK`, `ACK` or `FAILED`                 |
//! | `created_at` | Unix seconds                              |
//! | `updated_at` | Unix seconds                              |
//!
//! `(data, topic)` is unique: inserting the same pair again updates `retry`,
//! `next_retry`, `ack_status` and `updated_at` of the existing row.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::event::{AckStatus, Event};

/// Persisted status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    /// Still owed to its handlers; reloaded on startup.
    #[serde(rename = "NACK")]
    Pending,
    /// Acknowledged by every handler.
    #[serde(rename = "ACK")]
    Processed,
    /// Retry schedule exhausted.
    #[serde(rename = "FAILED")]
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "NACK",
            OutboxStatus::Processed => "ACK",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutboxStatus::Pending)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = BusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "NACK" => Ok(OutboxStatus::Pending),
            "ACK" => Ok(OutboxStatus::Processed),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(BusError::UnknownStatus(other.to_string())),
        }
    }
}

impl From<AckStatus> for OutboxStatus {
    fn from(status: AckStatus) -> Self {
        match status {
            AckStatus::Ack => OutboxStatus::Processed,
            AckStatus::Nack => OutboxStatus::Pending,
        }
    }
}

impl From<OutboxStatus> for AckStatus {
    fn from(status: OutboxStatus) -> Self {
        match status {
            OutboxStatus::Processed => AckStatus::Ack,
            OutboxStatus::Pending | OutboxStatus::Failed => AckStatus::Nack,
        }
    }
}

/// Persisted projection of an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Zero until the store assigns a key.
    pub id: i64,
    pub data: Vec<u8>,
    pub topic: String,
    pub retry: i32,
    /// Minutes; sub-minute delays are truncated.
    pub next_retry: u32,
    pub ack_status: OutboxStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OutboxRecord {
    /// Project an event onto a record, stamping both timestamps with now.
    pub fn from_event(event: &Event) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: event.id.unwrap_or_default(),
            data: event.data.clone(),
            topic: event.topic.clone(),
            retry: i32::try_from(event.retry).unwrap_or(i32::MAX),
            next_retry: duration_to_minutes(event.next_retry),
            ack_status: event.ack_status.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn into_event(self) -> Event {
        Event {
            id: (self.id != 0).then_some(self.id),
            data: self.data,
            topic: self.topic,
            retry: u32::try_from(self.retry).unwrap_or_default(),
            next_retry: minutes_to_duration(self.next_retry),
            ack_status: self.ack_status.into(),
        }
    }

    pub fn next_retry_duration(&self) -> Duration {
        minutes_to_duration(self.next_retry)
    }
}

impl From<&Event> for OutboxRecord {
    fn from(event: &Event) -> Self {
        OutboxRecord::from_event(event)
    }
}

impl From<OutboxRecord> for Event {
    fn from(record: OutboxRecord) -> Self {
        record.into_event()
    }
}

fn duration_to_minutes(duration: Duration) -> u32 {
    u32::try_from(duration.as_secs() / 60).unwrap_or(u32::MAX)
}

fn minutes_to_duration(minutes: u32) -> Duration {
    Duration::from_secs(u64::from(minutes) * 60)
}

/// Durable backing for the bus.
///
/// Implementations must be safe to call from many event tasks at once.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Insert `record`, or update retry/next_retry/status/updated_at of the
    /// existing row with the same `(data, topic)`. Returns the stored row.
    async fn insert_event(&self, record: &OutboxRecord) -> Result<OutboxRecord>;

    /// All records still pending (`NACK`), oldest first.
    async fn load_pending_events(&self) -> Result<Vec<OutboxRecord>>;

    /// Persist `retry`, `next_retry` and `ack_status` for `record.id`.
    async fn update_event_status(&self, record: &OutboxRecord) -> Result<()>;

    async fn mark_event_as_processed(&self, id: i64) -> Result<()>;

    async fn mark_event_as_failed(&self, id: i64) -> Result<()>;
}

#[async_trait]
impl<T: OutboxStore + ?Sized> OutboxStore for std::sync::Arc<T> {
    async fn insert_event(&self, record: &OutboxRecord) -> Result<OutboxRecord> {
        (**self).insert_event(record).await
    }

    async fn load_pending_events(&self) -> Result<Vec<OutboxRecord>> {
        (**self).load_pending_events().await
    }

    async fn update_event_status(&self, record: &OutboxRecord) -> Result<()> {
        (**self).update_event_status(record).await
    }

    async fn mark_event_as_processed(&self, id: i64) -> Result<()> {
        (**self).mark_event_as_processed(id).await
    }

    async fn mark_event_as_failed(&self, id: i64) -> Result<()> {
        (**self).mark_event_as_failed(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: Some(42),
            data: b"hello".to_vec(),
            topic: "greetings".to_string(),
            retry: 2,
            next_retry: Duration::from_secs(150),
            ack_status: AckStatus::Nack,
        }
    }

    #[test]
    fn round_trip_keeps_identity_and_truncates_next_retry_to_minutes() {
        let event = sample_event();
        let record = OutboxRecord::from_event(&event);

        assert_eq!(record.id, 42);
        assert_eq!(record.retry, 2);
        assert_eq!(record.next_retry, 2);
        assert_eq!(record.ack_status, OutboxStatus::Pending);

        let back = record.into_event();
        assert_eq!(back.id, event.id);
        assert_eq!(back.data, event.data);
        assert_eq!(back.topic, event.topic);
        assert_eq!(back.retry, event.retry);
        assert_eq!(back.ack_status, event.ack_status);
        // 2m30s comes back as 2m.
        assert_eq!(back.next_retry, Duration::from_secs(120));
        assert_ne!(back.next_retry, event.next_retry);
    }

    #[test]
    fn sub_minute_delays_are_lost() {
        let mut event = sample_event();
        event.next_retry = Duration::from_secs(59);

        let back = OutboxRecord::from_event(&event).into_event();
        assert_eq!(back.next_retry, Duration::ZERO);
    }

    #[test]
    fn in_memory_event_has_no_record_id() {
        let event = Event::new("topic", b"x".to_vec());
        let record = OutboxRecord::from(&event);

        assert_eq!(record.id, 0);
        assert_eq!(record.created_at, record.updated_at);
        assert_eq!(Event::from(record).id, None);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(OutboxStatus::from(AckStatus::Ack), OutboxStatus::Processed);
        assert_eq!(AckStatus::from(OutboxStatus::Failed), AckStatus::Nack);
        assert!(OutboxStatus::Failed.is_terminal());
        assert!(!OutboxStatus::Pending.is_terminal());

        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processed,
            OutboxStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<OutboxStatus>().is_err());
    }
}
