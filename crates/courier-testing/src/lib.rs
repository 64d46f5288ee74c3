//! Testing utilities for the courier event bus.
//!
//! - [`RecordingHandler`]: a handler with a scripted answer that remembers
//!   every event it was given
//! - [`FlakyOutboxStore`]: wraps any [`OutboxStore`] and fails chosen
//!   operations on demand
//! - [`wait_until`]: poll a condition with a deadline
//! - [`RunningBus`]: a dispatch loop running on its own task

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use courier::{
    AckStatus, CancellationToken, Event, EventBus, EventHandler, HandlerContext, OutboxRecord,
    OutboxStore,
};
use tokio::task::JoinHandle;

/// What a [`RecordingHandler`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    Always(AckStatus),
    /// `Nack` while `event.retry` is below the threshold, `Ack` from then on.
    AckFromRetry(u32),
    /// Panic while `event.retry` is below the threshold, `Ack` from then on.
    PanicUntilRetry(u32),
}

impl AckPolicy {
    fn decide(&self, event: &Event) -> AckStatus {
        match *self {
            AckPolicy::Always(status) => status,
            AckPolicy::AckFromRetry(threshold) if event.retry >= threshold => AckStatus::Ack,
            AckPolicy::AckFromRetry(_) => AckStatus::Nack,
            AckPolicy::PanicUntilRetry(threshold) if event.retry >= threshold => AckStatus::Ack,
            AckPolicy::PanicUntilRetry(threshold) => {
                panic!("handler told to panic until retry {threshold}")
            }
        }
    }
}

/// Invocation as seen by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub event: Event,
    pub handler_index: usize,
    /// `None` when the invocation panicked.
    pub status: Option<AckStatus>,
}

struct RecordingState {
    policy: AckPolicy,
    invocations: Mutex<Vec<Invocation>>,
}

/// Handler that answers according to an [`AckPolicy`] and records each call.
///
/// Clones share the same record, so keep one clone in the test and hand the
/// other to [`EventBus::subscribe`](courier::EventBus::subscribe).
#[derive(Clone)]
pub struct RecordingHandler {
    state: Arc<RecordingState>,
}

impl RecordingHandler {
    pub fn new(policy: AckPolicy) -> Self {
        Self {
            state: Arc::new(RecordingState {
                policy,
                invocations: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn acking() -> Self {
        Self::new(AckPolicy::Always(AckStatus::Ack))
    }

    pub fn nacking() -> Self {
        Self::new(AckPolicy::Always(AckStatus::Nack))
    }

    pub fn ack_from_retry(threshold: u32) -> Self {
        Self::new(AckPolicy::AckFromRetry(threshold))
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().len()
    }

    pub fn ack_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|invocation| invocation.status == Some(AckStatus::Ack))
            .count()
    }

    /// `event.retry` of every call, in call order.
    pub fn retries_seen(&self) -> Vec<u32> {
        self.lock()
            .iter()
            .map(|invocation| invocation.event.retry)
            .collect()
    }

    /// Payloads of every call, in call order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.lock()
            .iter()
            .map(|invocation| invocation.event.data.clone())
            .collect()
    }

    /// Wait until at least `count` calls were recorded.
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.call_count() >= count).await
    }

    /// Wait until at least `count` calls answered `Ack`.
    pub async fn wait_for_acks(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.ack_count() >= count).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Invocation>> {
        self.state
            .invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: &Event, handler_index: usize, status: Option<AckStatus>) {
        self.lock().push(Invocation {
            event: event.clone(),
            handler_index,
            status,
        });
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: Event, ctx: HandlerContext) -> AckStatus {
        if let AckPolicy::PanicUntilRetry(threshold) = self.state.policy {
            if event.retry < threshold {
                self.record(&event, ctx.handler_index(), None);
            }
        }

        let status = self.state.policy.decide(&event);
        self.record(&event, ctx.handler_index(), Some(status));
        status
    }
}

/// Outbox wrapper whose operations can be made to fail at runtime.
pub struct FlakyOutboxStore<S> {
    inner: S,
    fail_inserts: AtomicBool,
    fail_loads: AtomicBool,
    fail_updates: AtomicBool,
    inserts: AtomicUsize,
    loads: AtomicUsize,
    updates: AtomicUsize,
}

impl<S: OutboxStore> FlakyOutboxStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_inserts: AtomicBool::new(false),
            fail_loads: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            inserts: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Fail status updates and both terminal transitions.
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Insert attempts, failed ones included.
    pub fn insert_calls(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Update and mark attempts, failed ones included.
    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    fn check_update(&self) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            bail!("injected outbox update failure");
        }
        Ok(())
    }
}

#[async_trait]
impl<S: OutboxStore> OutboxStore for FlakyOutboxStore<S> {
    async fn insert_event(&self, record: &OutboxRecord) -> Result<OutboxRecord> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            bail!("injected outbox insert failure");
        }
        self.inner.insert_event(record).await
    }

    async fn load_pending_events(&self) -> Result<Vec<OutboxRecord>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_loads.load(Ordering::SeqCst) {
            bail!("injected outbox load failure");
        }
        self.inner.load_pending_events().await
    }

    async fn update_event_status(&self, record: &OutboxRecord) -> Result<()> {
        self.check_update()?;
        self.inner.update_event_status(record).await
    }

    async fn mark_event_as_processed(&self, id: i64) -> Result<()> {
        self.check_update()?;
        self.inner.mark_event_as_processed(id).await
    }

    async fn mark_event_as_failed(&self, id: i64) -> Result<()> {
        self.check_update()?;
        self.inner.mark_event_as_failed(id).await
    }
}

/// A bus whose dispatch loop runs on a spawned task.
pub struct RunningBus {
    pub bus: EventBus,
    shutdown: CancellationToken,
    handle: JoinHandle<courier::Result<()>>,
}

impl RunningBus {
    /// Spawn `bus.start_processing` with a fresh shutdown token.
    pub fn start(bus: &EventBus) -> Self {
        let shutdown = CancellationToken::new();
        let runner = bus.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { runner.start_processing(token).await });

        Self {
            bus: bus.clone(),
            shutdown,
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the caller token and return what `start_processing` returned.
    pub async fn shutdown(self) -> Result<courier::Result<()>> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for `start_processing` to return on its own.
    pub async fn join(self) -> Result<courier::Result<()>> {
        Ok(self.handle.await?)
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
