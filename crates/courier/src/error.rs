//! Error types for the event bus.
//!
//! Only a handful of failures ever reach callers: a publish whose outbox
//! insert failed, a recovery load that failed at startup, and lifecycle
//! misuse. Everything that happens while an event is in flight is logged
//! instead.

use thiserror::Error;

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    /// The outbox rejected the event, so it was not queued.
    #[error("outbox insert failed: {0:#}")]
    Outbox(#[source] anyhow::Error),

    /// Pending outbox records could not be loaded at startup.
    #[error("outbox recovery failed: {0:#}")]
    Recovery(#[source] anyhow::Error),

    /// The bus was stopped before the event could be queued.
    #[error("event bus is stopped")]
    Stopped,

    /// `start_processing` was called while another dispatch loop owns the queue.
    #[error("event processing already started")]
    AlreadyStarted,

    /// A persisted status string did not match any known status.
    #[error("unknown ack status: {0}")]
    UnknownStatus(String),
}

impl BusError {
    /// True for errors caused by the durable store rather than the bus itself.
    pub fn is_outbox_failure(&self) -> bool {
        matches!(self, BusError::Outbox(_) | BusError::Recovery(_))
    }
}
