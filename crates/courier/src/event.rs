//! Events flowing through the bus and their acknowledgment status.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Outcome of a single handler invocation.
///
/// `Ack` means the event is done for that handler. `Nack` asks the bus to
/// retry the event if the topic's delay schedule still has room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AckStatus {
    #[serde(rename = "ACK")]
    Ack,
    #[default]
    #[serde(rename = "NACK")]
    Nack,
}

impl AckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckStatus::Ack => "ACK",
            AckStatus::Nack => "NACK",
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, AckStatus::Ack)
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckStatus {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACK" => Ok(AckStatus::Ack),
            "NACK" => Ok(AckStatus::Nack),
            other => Err(BusError::UnknownStatus(other.to_string())),
        }
    }
}

/// A unit of work published to a topic.
///
/// `id` is only set when the event is backed by an outbox record. `retry`
/// and `next_retry` are owned by the dispatch path: handlers observe them but
/// any change they make to their copy is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: Option<i64>,
    pub data: Vec<u8>,
    pub topic: String,
    pub retry: u32,
    pub next_retry: Duration,
    pub ack_status: AckStatus,
}

impl Event {
    /// Create a fresh, never-attempted event.
    pub fn new(topic: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: None,
            data: data.into(),
            topic: topic.into(),
            retry: 0,
            next_retry: Duration::ZERO,
            ack_status: AckStatus::Nack,
        }
    }

    /// Whether the event has a durable outbox record behind it.
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Payload as UTF-8, when it is valid UTF-8.
    pub fn data_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}
