//! Event handlers.
//!
//! A handler receives its own copy of the event plus a [`HandlerContext`] and
//! answers with an [`AckStatus`]. Plain async closures implement
//! [`EventHandler`] through a blanket impl, so most subscriptions never name
//! the trait:
//!
//! ```ignore
//! bus.subscribe("emails", |event: Event, _ctx: HandlerContext| async move {
//!     match send(&event.data).await {
//!         Ok(()) => AckStatus::Ack,
//!         Err(_) => AckStatus::Nack,
//!     }
//! }, &[1, 5, 30], Duration::from_secs(1));
//! ```

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::event::{AckStatus, Event};

/// Per-invocation context handed to handlers.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    cancellation: CancellationToken,
    handler_index: usize,
}

impl HandlerContext {
    pub(crate) fn new(cancellation: CancellationToken, handler_index: usize) -> Self {
        Self {
            cancellation,
            handler_index,
        }
    }

    /// Token cancelled when the bus stops. The bus never interrupts a running
    /// handler; long handlers can watch this to bail out early.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Position of this handler in its topic's subscription order.
    pub fn handler_index(&self) -> usize {
        self.handler_index
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event, ctx: HandlerContext) -> AckStatus;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AckStatus> + Send + 'static,
{
    async fn handle(&self, event: Event, ctx: HandlerContext) -> AckStatus {
        (self)(event, ctx).await
    }
}
