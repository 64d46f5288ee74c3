//! # Courier
//!
//! An in-process event bus with topic subscriptions, bounded per-topic retry
//! schedules and an optional durable outbox for crash recovery.
//!
//! ## Architecture
//!
//! ```text
//! publish(topic, data)
//!     │
//!     ├─► OutboxStore.insert_event()      (only with an outbox attached)
//!     │
//!     ▼
//! bounded queue ◄──────────────────────────────────────┐
//!     │                                                │
//!     ▼ start_processing() dispatch loop               │
//! one task per event                                   │
//!     │                                                │
//!     ├─► retry >= delays.len() ─► mark failed         │
//!     │                                                │
//!     ├─► all handlers ACK ─► mark processed           │
//!     │                                                │
//!     └─► some handler NACK                            │
//!            └─► update status ─► sleep ───────────────┘
//! ```
//!
//! The last scheduled attempt is terminal whatever the handlers return; set
//! [`BusConfig::final_ack_processed`] to record a final ACK as processed.
//!
//! ## Guarantees
//!
//! - **Backpressure**: the queue is bounded, a full queue makes publishers
//!   wait instead of dropping events
//! - **Bounded retries**: an event is retried at most once per configured
//!   delay, then it is terminal
//! - **Isolation**: every event runs in its own task; a panicking handler
//!   counts as a `NACK`
//! - **Recovery**: pending outbox records are replayed once when processing
//!   starts; records this bus already holds in memory are not replayed
//!
//! Not provided: exactly-once delivery, ordering between in-flight events,
//! or anything that crosses a process boundary.
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use courier::{AckStatus, Event, EventBus, HandlerContext};
//! use tokio_util::sync::CancellationToken;
//!
//! let bus = EventBus::builder()
//!     .capacity(100)
//!     .with_outbox(MemoryOutboxStore::new())
//!     .build();
//!
//! bus.subscribe(
//!     "invoices",
//!     |event: Event, _ctx: HandlerContext| async move {
//!         if deliver(&event.data).await.is_ok() { AckStatus::Ack } else { AckStatus::Nack }
//!     },
//!     &[1, 5, 30],
//!     Duration::from_secs(1),
//! );
//!
//! let runner = bus.clone();
//! tokio::spawn(async move { runner.start_processing(CancellationToken::new()).await });
//!
//! bus.publish("invoices", b"{\"id\":1}".to_vec()).await;
//! ```

mod bus;
mod config;
mod error;
mod event;
mod handler;
mod subscription;

pub mod outbox;

pub use bus::{EventBus, EventBusBuilder};
pub use config::{BusConfig, DEFAULT_CAPACITY};
pub use error::{BusError, Result};
pub use event::{AckStatus, Event};
pub use handler::{EventHandler, HandlerContext};
pub use outbox::{OutboxRecord, OutboxStatus, OutboxStore};
pub use subscription::{scale_delays, Subscription};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
