//! Publishes a few orders against a handler that fails the first attempt,
//! stops the bus while a retry is still scheduled, then starts a second bus
//! on the same outbox and watches it finish the work.
//!
//! ```sh
//! RUST_LOG=debug cargo run -p outbox-recovery
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use courier::{AckStatus, CancellationToken, Event, EventBus, HandlerContext, OutboxStatus};
use courier_outbox::MemoryOutboxStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

const TOPIC: &str = "orders";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = Arc::new(MemoryOutboxStore::new());

    // First run: the warehouse is down, every order is NACKed and parked
    // behind a one-minute retry.
    let warehouse_up = Arc::new(AtomicBool::new(false));
    let first = bus(&store, &warehouse_up);
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let bus = first.clone();
        let shutdown = shutdown.clone();
        async move { bus.start_processing(shutdown).await }
    });

    for order in ["order-1", "order-2", "order-3"] {
        first.try_publish(TOPIC, order).await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!(
        pending = store.count_by_status(OutboxStatus::Pending),
        "stopping first bus with retries outstanding"
    );
    first.stop();
    handle.await??;

    // Second run: the warehouse is back and the outbox replay delivers the
    // parked orders without anyone publishing them again.
    warehouse_up.store(true, Ordering::SeqCst);
    let second = bus(&store, &warehouse_up);
    let handle = tokio::spawn({
        let bus = second.clone();
        let shutdown = shutdown.clone();
        async move { bus.start_processing(shutdown).await }
    });

    while store.count_by_status(OutboxStatus::Processed) < 3 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    for record in store.records() {
        info!(id = record.id, retry = record.retry, status = %record.ack_status, "outbox record");
    }

    shutdown.cancel();
    handle.await??;
    Ok(())
}

fn bus(store: &Arc<MemoryOutboxStore>, warehouse_up: &Arc<AtomicBool>) -> EventBus {
    let bus = EventBus::builder().with_outbox(Arc::clone(store)).build();
    let warehouse_up = Arc::clone(warehouse_up);

    bus.subscribe(
        TOPIC,
        move |event: Event, _ctx: HandlerContext| {
            let up = warehouse_up.load(Ordering::SeqCst);
            async move {
                let order = event.data_str().unwrap_or("<binary>");
                if up {
                    info!(order, "order shipped");
                    AckStatus::Ack
                } else {
                    info!(order, "warehouse unavailable");
                    AckStatus::Nack
                }
            }
        },
        &[1, 5, 15],
        Duration::from_secs(60),
    );
    bus
}
