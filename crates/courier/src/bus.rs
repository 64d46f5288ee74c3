//! The event bus: subscriptions, bounded queue, dispatch loop and retries.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::FutureExt;
use smallvec::SmallVec;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing::{debug, error, info, info_span, warn, Dispatch, Instrument, Span};

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::event::{AckStatus, Event};
use crate::handler::{EventHandler, HandlerContext};
use crate::outbox::{OutboxRecord, OutboxStore};
use crate::subscription::{scale_delays, Subscription, SubscriptionTable};

type HandlerIndices = SmallVec<[usize; 4]>;

/// Which handlers of a topic still owe an answer for an event.
#[derive(Debug, Clone)]
enum HandlerSelection {
    All,
    Only(HandlerIndices),
}

impl HandlerSelection {
    fn indices(&self, handler_count: usize) -> HandlerIndices {
        match self {
            HandlerSelection::All => (0..handler_count).collect(),
            HandlerSelection::Only(indices) => indices
                .iter()
                .copied()
                .filter(|&index| index < handler_count)
                .collect(),
        }
    }
}

/// An event on its way through the queue.
#[derive(Debug)]
struct Delivery {
    event: Event,
    selection: HandlerSelection,
}

impl Delivery {
    fn new(event: Event) -> Self {
        Self {
            event,
            selection: HandlerSelection::All,
        }
    }
}

struct Inner {
    config: BusConfig,
    subscriptions: SubscriptionTable,
    queue: mpsc::Sender<Delivery>,
    receiver: Mutex<Option<mpsc::Receiver<Delivery>>>,
    outbox: Option<Arc<dyn OutboxStore>>,
    /// Outbox ids of events queued, running or waiting for a retry on this
    /// bus. Recovery skips them.
    in_flight: DashSet<i64>,
    lifecycle: CancellationToken,
    dispatch: Option<Dispatch>,
}

/// Builder for [`EventBus`].
///
/// ```ignore
/// let bus = EventBus::builder()
///     .capacity(256)
///     .with_outbox(PgOutboxStore::new(pool))
///     .with_dispatch(tracing::Dispatch::new(subscriber))
///     .build();
/// ```
#[derive(Default)]
pub struct EventBusBuilder {
    config: BusConfig,
    outbox: Option<Arc<dyn OutboxStore>>,
    dispatch: Option<Dispatch>,
    parent: Option<CancellationToken>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Back the bus with a durable outbox. Without one the bus is purely
    /// in-memory and nothing survives a restart.
    pub fn with_outbox<S: OutboxStore>(mut self, store: S) -> Self {
        self.outbox = Some(Arc::new(store));
        self
    }

    /// Route the bus's logs to `dispatch` instead of whatever subscriber is
    /// current where the bus happens to be driven.
    pub fn with_dispatch(mut self, dispatch: impl Into<Dispatch>) -> Self {
        self.dispatch = Some(dispatch.into());
        self
    }

    /// Tie the bus lifecycle to an outer token: cancelling `token` stops the
    /// bus just like [`EventBus::stop`].
    pub fn parent_token(mut self, token: CancellationToken) -> Self {
        self.parent = Some(token);
        self
    }

    pub fn build(self) -> EventBus {
        let (queue, receiver) = mpsc::channel(self.config.effective_capacity());
        let lifecycle = match self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        EventBus {
            inner: Arc::new(Inner {
                config: self.config,
                subscriptions: SubscriptionTable::default(),
                queue,
                receiver: Mutex::new(Some(receiver)),
                outbox: self.outbox,
                in_flight: DashSet::new(),
                lifecycle,
                dispatch: self.dispatch,
            }),
        }
    }
}

/// In-process event bus with per-topic retry schedules.
///
/// Cloning is cheap and every clone drives the same bus.
///
/// Delivery is at-least-once only while an outbox is attached and reachable;
/// without one, events still queued or waiting for a retry are lost when the
/// process exits.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.inner.config)
            .field("topics", &self.inner.subscriptions.topics())
            .field("outbox", &self.inner.outbox.is_some())
            .field("stopped", &self.inner.lifecycle.is_cancelled())
            .finish()
    }
}

impl EventBus {
    /// In-memory bus with a queue of `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self::builder().capacity(capacity).build()
    }

    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Register `handler` for `topic` with retry delays `delays[i] * unit`.
    ///
    /// Handlers for the same topic accumulate and run in subscription order.
    /// The delay schedule does not accumulate: the latest subscription's
    /// schedule applies to the whole topic, including events already waiting
    /// for a retry.
    pub fn subscribe<H: EventHandler>(
        &self,
        topic: impl AsRef<str>,
        handler: H,
        delays: &[u32],
        unit: Duration,
    ) {
        let topic = topic.as_ref();
        let delays = scale_delays(delays, unit);
        let outcome = self
            .inner
            .subscriptions
            .subscribe(topic, Arc::new(handler), delays.clone());

        self.with_logger(|| match outcome.replaced_delays {
            Some(previous) => warn!(
                topic,
                handlers = outcome.handler_count,
                ?previous,
                current = ?delays,
                "retry schedule replaced by new subscription"
            ),
            None => debug!(
                topic,
                handlers = outcome.handler_count,
                max_retries = delays.len(),
                "handler subscribed"
            ),
        });
    }

    /// Publish `data` to `topic`.
    ///
    /// With an outbox attached the event is persisted first; if that fails
    /// the event is dropped and the failure logged. Waits while the queue is
    /// full. Use [`try_publish`](Self::try_publish) to observe failures.
    pub async fn publish(&self, topic: impl Into<String>, data: impl Into<Vec<u8>>) {
        // try_publish logs every failure it returns.
        let _ = self.try_publish(topic, data).await;
    }

    /// Same as [`publish`](Self::publish) but reports why an event was not
    /// queued.
    pub async fn try_publish(
        &self,
        topic: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let mut event = Event::new(topic, data);

        self.in_bus_context(async move {
            if let Some(outbox) = &self.inner.outbox {
                match outbox.insert_event(&OutboxRecord::from_event(&event)).await {
                    Ok(stored) => event.id = (stored.id != 0).then_some(stored.id),
                    Err(err) => {
                        let error = format!("{err:#}");
                        error!(topic = %event.topic, %error, "failed to persist event, publish aborted");
                        return Err(BusError::Outbox(err));
                    }
                }
            }

            let (topic, id) = (event.topic.clone(), event.id);
            if let Some(id) = id {
                self.inner.in_flight.insert(id);
            }
            self.enqueue(Delivery::new(event)).await.inspect_err(|_| {
                self.release(id);
                warn!(%topic, event_id = ?id, "bus stopped, event not queued");
            })
        })
        .await
    }

    /// Replay pending outbox records, then dispatch events until `shutdown`
    /// is cancelled, the bus is stopped, or the queue closes.
    ///
    /// Only a failed recovery load is returned as an error. Every event runs
    /// in its own task, so handlers for different events overlap freely.
    pub async fn start_processing(&self, shutdown: CancellationToken) -> Result<()> {
        let mut receiver = self
            .inner
            .receiver
            .lock()
            .await
            .take()
            .ok_or(BusError::AlreadyStarted)?;
        let run = self.inner.lifecycle.child_token();

        self.in_bus_context(async move {
            if self.inner.config.recover_on_start {
                if let Err(err) = self.recover(&run).await {
                    *self.inner.receiver.lock().await = Some(receiver);
                    return Err(err);
                }
            }

            info!(capacity = self.inner.config.effective_capacity(), "event processing started");

            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        info!("processing stopped due to context cancellation");
                        break;
                    }
                    () = run.cancelled() => {
                        info!("processing stopped, event bus stopped");
                        break;
                    }
                    next = receiver.recv() => match next {
                        Some(delivery) => self.spawn_processing(delivery, run.clone()),
                        None => {
                            info!("processing stopped, queue channel closed");
                            break;
                        }
                    },
                }
            }

            // Retries scheduled by this run die with it.
            run.cancel();
            *self.inner.receiver.lock().await = Some(receiver);
            Ok(())
        })
        .await
    }

    /// Stop the bus. The dispatch loop, pending retry timers and blocked
    /// re-enqueues observe the cancellation; handlers already running finish.
    pub fn stop(&self) {
        self.inner.lifecycle.cancel();
        self.with_logger(|| info!("event bus stopped"));
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lifecycle.is_cancelled()
    }

    /// True once `event.retry` is past the topic's delay schedule.
    pub fn exceeded_max_retries(&self, event: &Event) -> bool {
        event.retry > self.max_retries(&event.topic)
    }

    /// True once no further retry would be scheduled for `event`.
    pub fn reached_max_retries(&self, event: &Event) -> bool {
        event.retry >= self.max_retries(&event.topic)
    }

    /// Length of the topic's delay schedule; zero for unknown topics.
    pub fn max_retries(&self, topic: &str) -> u32 {
        self.inner
            .subscriptions
            .get(topic)
            .map(|subscription| subscription.max_retries())
            .unwrap_or_default()
    }

    /// Snapshot of the handlers and delays currently registered for `topic`.
    pub fn subscription(&self, topic: &str) -> Option<Arc<Subscription>> {
        self.inner.subscriptions.get(topic)
    }

    pub fn delays(&self, topic: &str) -> Vec<Duration> {
        self.inner
            .subscriptions
            .get(topic)
            .map(|subscription| subscription.delays().to_vec())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner
            .subscriptions
            .get(topic)
            .map(|subscription| subscription.handlers().len())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.subscriptions.topics()
    }

    pub fn has_outbox(&self) -> bool {
        self.inner.outbox.is_some()
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Events currently sitting in the queue.
    pub fn queued(&self) -> usize {
        self.inner.queue.max_capacity() - self.inner.queue.capacity()
    }

    async fn enqueue(&self, delivery: Delivery) -> Result<()> {
        let lifecycle = &self.inner.lifecycle;
        if lifecycle.is_cancelled() {
            return Err(BusError::Stopped);
        }

        tokio::select! {
            biased;
            () = lifecycle.cancelled() => Err(BusError::Stopped),
            sent = self.inner.queue.send(delivery) => sent.map_err(|_| BusError::Stopped),
        }
    }

    async fn recover(&self, run: &CancellationToken) -> Result<()> {
        let Some(outbox) = &self.inner.outbox else {
            return Ok(());
        };

        let records = match outbox.load_pending_events().await {
            Ok(records) => records,
            Err(err) => {
                let error = format!("{err:#}");
                error!(%error, "failed to load events from outbox");
                return Err(BusError::Recovery(err));
            }
        };

        let total = records.len();
        let mut backlog: VecDeque<Delivery> = records
            .into_iter()
            .filter(|record| self.inner.in_flight.insert(record.id))
            .map(|record| Delivery::new(record.into_event()))
            .collect();
        let skipped = total - backlog.len();
        let total = backlog.len();
        if skipped > 0 {
            debug!(skipped, "pending outbox events already queued by this bus");
        }

        while let Some(delivery) = backlog.pop_front() {
            match self.inner.queue.try_reserve() {
                Ok(permit) => permit.send(delivery),
                Err(_) => {
                    backlog.push_front(delivery);
                    break;
                }
            }
        }

        if backlog.is_empty() {
            info!(recovered = total, "pending outbox events replayed");
            return Ok(());
        }

        // The dispatch loop is not running yet, so whatever does not fit is
        // fed in once it starts draining.
        info!(
            recovered = total,
            deferred = backlog.len(),
            "pending outbox events exceed queue capacity, replaying in background"
        );
        let bus = self.clone();
        let run = run.clone();
        tokio::spawn(self.in_bus_context(async move {
            while let Some(delivery) = backlog.pop_front() {
                let id = delivery.event.id;
                let sent = tokio::select! {
                    biased;
                    () = run.cancelled() => {
                        debug!("outbox replay cancelled");
                        false
                    }
                    sent = bus.inner.queue.send(delivery) => sent.is_ok(),
                };
                if !sent {
                    bus.release(id);
                    for rest in backlog {
                        bus.release(rest.event.id);
                    }
                    return;
                }
            }
            debug!("outbox replay finished");
        }));

        Ok(())
    }

    fn spawn_processing(&self, delivery: Delivery, run: CancellationToken) {
        let span = info_span!(
            "event",
            topic = %delivery.event.topic,
            event_id = ?delivery.event.id,
            retry = delivery.event.retry,
        );
        let bus = self.clone();
        tokio::spawn(self.in_bus_context(bus.process(delivery, run).instrument(span)));
    }

    async fn process(self, delivery: Delivery, run: CancellationToken) {
        let Some(subscription) = self.inner.subscriptions.get(&delivery.event.topic) else {
            debug!("no handlers subscribed, event dropped");
            self.release(delivery.event.id);
            return;
        };

        let mut event = delivery.event;
        let handlers = subscription.handlers();
        let mut nacked = HandlerIndices::new();

        for index in delivery.selection.indices(handlers.len()) {
            let status = invoke(&handlers[index], &event, index, &run).await;
            if !status.is_ack() {
                nacked.push(index);
            }
        }

        let max_retries = subscription.max_retries();
        let acknowledged = nacked.is_empty();
        let exhausted = event.retry >= max_retries;

        if acknowledged && (!exhausted || self.inner.config.final_ack_processed) {
            event.ack_status = AckStatus::Ack;
            debug!("event acknowledged");
            if let Some(id) = event.id {
                self.mark_processed(id).await;
            }
            self.release(event.id);
            return;
        }

        // The last scheduled attempt is terminal whatever the handlers said.
        if exhausted {
            warn!(
                max_retries,
                acknowledged,
                pending_handlers = nacked.len(),
                "max retries reached for event"
            );
            if let Some(id) = event.id {
                self.mark_failed(id).await;
            }
            self.release(event.id);
            return;
        }

        event.retry += 1;
        event.next_retry = subscription.delay_for(event.retry).unwrap_or_default();
        event.ack_status = AckStatus::Nack;
        if event.id.is_some() {
            self.update_status(&event).await;
        }

        debug!(
            next_retry = ?event.next_retry,
            attempt = event.retry,
            pending_handlers = nacked.len(),
            "event scheduled for retry"
        );
        self.spawn_retry(
            Delivery {
                event,
                selection: HandlerSelection::Only(nacked),
            },
            run,
        );
    }

    fn spawn_retry(&self, delivery: Delivery, run: CancellationToken) {
        let bus = self.clone();
        let delay = delivery.event.next_retry;
        let id = delivery.event.id;

        // An abandoned retry leaves its record pending for the next replay.
        let retry = async move {
            tokio::select! {
                biased;
                () = run.cancelled() => {
                    debug!("retry canceled due to context cancellation");
                    bus.release(id);
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            tokio::select! {
                biased;
                () = run.cancelled() => {
                    debug!("failed to enqueue event due to context cancellation");
                    bus.release(id);
                }
                sent = bus.inner.queue.send(delivery) => match sent {
                    Ok(()) => debug!(?delay, "event re-enqueued after delay"),
                    Err(_) => {
                        debug!("queue closed, retry dropped");
                        bus.release(id);
                    }
                },
            }
        };

        tokio::spawn(self.in_bus_context(retry.instrument(Span::current())));
    }

    async fn update_status(&self, event: &Event) {
        let Some(outbox) = &self.inner.outbox else {
            return;
        };
        if let Err(err) = outbox.update_event_status(&OutboxRecord::from_event(event)).await {
            let error = format!("{err:#}");
            error!(%error, "failed to update event status in outbox");
        }
    }

    async fn mark_processed(&self, id: i64) {
        let Some(outbox) = &self.inner.outbox else {
            return;
        };
        if let Err(err) = outbox.mark_event_as_processed(id).await {
            let error = format!("{err:#}");
            error!(%error, "failed to mark event as processed in outbox");
        }
    }

    async fn mark_failed(&self, id: i64) {
        let Some(outbox) = &self.inner.outbox else {
            return;
        };
        if let Err(err) = outbox.mark_event_as_failed(id).await {
            let error = format!("{err:#}");
            error!(%error, "failed to mark event as failed in outbox");
        }
    }

    /// Forget an outbox id once this bus no longer holds the event in
    /// memory, so a later replay may pick its record up again.
    fn release(&self, id: Option<i64>) {
        if let Some(id) = id {
            self.inner.in_flight.remove(&id);
        }
    }

    /// Attach the bus's logger to a future that runs on another task.
    fn in_bus_context<F: Future>(&self, future: F) -> WithDispatch<F> {
        match &self.inner.dispatch {
            Some(dispatch) => future.with_subscriber(dispatch.clone()),
            None => future.with_current_subscriber(),
        }
    }

    fn with_logger<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.inner.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }
}

/// Run one handler, turning a panic into `Nack`.
async fn invoke(
    handler: &Arc<dyn EventHandler>,
    event: &Event,
    index: usize,
    run: &CancellationToken,
) -> AckStatus {
    let ctx = HandlerContext::new(run.clone(), index);
    match AssertUnwindSafe(handler.handle(event.clone(), ctx))
        .catch_unwind()
        .await
    {
        Ok(status) => status,
        Err(panic) => {
            let panic = panic_message(panic.as_ref());
            error!(handler = index, %panic, "handler panicked, treating as NACK");
            AckStatus::Nack
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
