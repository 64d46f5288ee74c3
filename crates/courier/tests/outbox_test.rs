//! Integration tests for the outbox-backed bus: persistence on publish,
//! status transitions, idempotent inserts and startup recovery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use courier::{
    BusConfig, BusError, Event, EventBus, OutboxRecord, OutboxStatus, OutboxStore,
};
use courier_outbox::MemoryOutboxStore;
use courier_testing::{wait_until, FlakyOutboxStore, RecordingHandler, RunningBus};

const MS: Duration = Duration::from_millis(1);

fn bus_with(store: &Arc<MemoryOutboxStore>) -> EventBus {
    EventBus::builder().with_outbox(Arc::clone(store)).build()
}

async fn seed_pending(store: &MemoryOutboxStore, topic: &str, payloads: &[&str]) -> Result<()> {
    for payload in payloads {
        store
            .insert_event(&OutboxRecord::from_event(&Event::new(topic, payload.as_bytes())))
            .await?;
    }
    Ok(())
}

#[tokio::test]
async fn published_event_carries_outbox_id_and_is_marked_processed() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());
    let bus = bus_with(&store);
    let handler = RecordingHandler::acking();
    bus.subscribe("orders", handler.clone(), &[1], Duration::from_secs(1));
    assert!(bus.has_outbox());

    let running = RunningBus::start(&bus);
    bus.try_publish("orders", b"order-1".to_vec()).await?;

    assert!(handler.wait_for_acks(1, Duration::from_secs(1)).await);
    let seen = &handler.invocations()[0].event;
    assert_eq!(seen.id, Some(1));
    assert!(seen.is_persisted());

    assert!(
        wait_until(Duration::from_secs(1), || {
            store.count_by_status(OutboxStatus::Processed) == 1
        })
        .await
    );

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn exhausted_event_is_marked_failed() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());
    let bus = bus_with(&store);
    let handler = RecordingHandler::nacking();
    bus.subscribe("orders", handler.clone(), &[5, 5], MS);

    let running = RunningBus::start(&bus);
    bus.publish("orders", b"order-1".to_vec()).await;

    assert!(
        wait_until(Duration::from_secs(2), || {
            store.count_by_status(OutboxStatus::Failed) == 1
        })
        .await
    );
    let record = store.get(1).expect("record should exist");
    assert_eq!(record.retry, 2);
    assert_eq!(handler.call_count(), 3);
    assert!(store.load_pending_events().await?.is_empty());

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn scheduled_retry_is_persisted() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());
    let bus = bus_with(&store);
    let handler = RecordingHandler::nacking();
    bus.subscribe("orders", handler.clone(), &[2], Duration::from_secs(60));

    let running = RunningBus::start(&bus);
    bus.publish("orders", b"order-1".to_vec()).await;

    assert!(wait_until(Duration::from_secs(1), || store.get(1).is_some_and(|r| r.retry == 1)).await);
    let record = store.get(1).expect("record should exist");
    assert_eq!(record.ack_status, OutboxStatus::Pending);
    assert_eq!(record.next_retry, 2);

    bus.stop();
    running.join().await??;

    // The retry never ran, so the record stays pending for the next start.
    assert_eq!(store.load_pending_events().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_insert_aborts_publish() -> Result<()> {
    let store = Arc::new(FlakyOutboxStore::new(MemoryOutboxStore::new()));
    let bus = EventBus::builder().with_outbox(Arc::clone(&store)).build();
    let handler = RecordingHandler::acking();
    bus.subscribe("orders", handler.clone(), &[], MS);

    store.fail_inserts(true);
    let result = bus.try_publish("orders", b"order-1".to_vec()).await;
    assert!(matches!(result, Err(BusError::Outbox(_))));
    assert!(result.unwrap_err().is_outbox_failure());

    // The fire-and-forget variant swallows the same failure.
    bus.publish("orders", b"order-2".to_vec()).await;
    assert_eq!(bus.queued(), 0);
    assert_eq!(store.insert_calls(), 2);

    let running = RunningBus::start(&bus);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.call_count(), 0);

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn outbox_update_failures_do_not_stop_processing() -> Result<()> {
    let store = Arc::new(FlakyOutboxStore::new(MemoryOutboxStore::new()));
    let bus = EventBus::builder().with_outbox(Arc::clone(&store)).build();
    let handler = RecordingHandler::ack_from_retry(1);
    bus.subscribe("orders", handler.clone(), &[5], MS);

    let running = RunningBus::start(&bus);
    bus.try_publish("orders", b"order-1".to_vec()).await?;
    store.fail_updates(true);

    assert!(handler.wait_for_acks(1, Duration::from_secs(2)).await);
    assert!(wait_until(Duration::from_secs(1), || store.update_calls() >= 2).await);
    assert_eq!(store.inner().count_by_status(OutboxStatus::Processed), 0);

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn duplicate_publish_upserts_one_row() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());
    let bus = bus_with(&store);

    bus.try_publish("orders", b"same".to_vec()).await?;
    bus.try_publish("orders", b"same".to_vec()).await?;
    bus.try_publish("invoices", b"same".to_vec()).await?;

    assert_eq!(store.len(), 2);
    assert_eq!(bus.queued(), 3);
    let orders: Vec<_> = store
        .records()
        .into_iter()
        .filter(|record| record.topic == "orders")
        .collect();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].retry, 0);
    assert_eq!(orders[0].ack_status, OutboxStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn pending_events_are_replayed_exactly_once() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());
    seed_pending(&store, "orders", &["a", "b", "c"]).await?;
    store.mark_event_as_processed(2).await?;

    let bus = bus_with(&store);
    let handler = RecordingHandler::acking();
    bus.subscribe("orders", handler.clone(), &[1], MS);

    let running = RunningBus::start(&bus);
    assert!(handler.wait_for_calls(2, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut payloads = handler.payloads();
    payloads.sort();
    assert_eq!(payloads, vec![b"a".to_vec(), b"c".to_vec()]);
    assert!(
        wait_until(Duration::from_secs(1), || {
            store.count_by_status(OutboxStatus::Processed) == 3
        })
        .await
    );

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn recovered_event_keeps_its_retry_count() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());
    let mut event = Event::new("orders", b"half-done".to_vec());
    event.retry = 2;
    store.insert_event(&OutboxRecord::from_event(&event)).await?;

    let bus = bus_with(&store);
    let handler = RecordingHandler::nacking();
    bus.subscribe("orders", handler.clone(), &[5, 5], MS);

    let running = RunningBus::start(&bus);
    assert!(
        wait_until(Duration::from_secs(1), || {
            store.count_by_status(OutboxStatus::Failed) == 1
        })
        .await
    );
    assert_eq!(handler.retries_seen(), vec![2]);

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn backlog_larger_than_queue_is_replayed() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());
    seed_pending(&store, "orders", &["1", "2", "3", "4", "5", "6", "7"]).await?;

    let bus = EventBus::builder()
        .capacity(2)
        .with_outbox(Arc::clone(&store))
        .build();
    let handler = RecordingHandler::acking();
    bus.subscribe("orders", handler.clone(), &[], MS);

    let running = RunningBus::start(&bus);
    assert!(handler.wait_for_calls(7, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.call_count(), 7);

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn recovery_failure_is_returned_and_start_can_be_retried() -> Result<()> {
    let store = Arc::new(FlakyOutboxStore::new(MemoryOutboxStore::new()));
    seed_pending(store.inner(), "orders", &["a"]).await?;

    let bus = EventBus::builder().with_outbox(Arc::clone(&store)).build();
    let handler = RecordingHandler::acking();
    bus.subscribe("orders", handler.clone(), &[], MS);

    store.fail_loads(true);
    let result = bus.start_processing(courier::CancellationToken::new()).await;
    assert!(matches!(result, Err(BusError::Recovery(_))));
    assert_eq!(handler.call_count(), 0);

    store.fail_loads(false);
    let running = RunningBus::start(&bus);
    assert!(handler.wait_for_calls(1, Duration::from_secs(1)).await);
    assert_eq!(store.load_calls(), 2);

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn recovery_can_be_disabled() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());
    seed_pending(&store, "orders", &["a"]).await?;

    let config = BusConfig {
        recover_on_start: false,
        ..BusConfig::default()
    };
    let bus = EventBus::builder()
        .config(config)
        .with_outbox(Arc::clone(&store))
        .build();
    let handler = RecordingHandler::acking();
    bus.subscribe("orders", handler.clone(), &[], MS);

    let running = RunningBus::start(&bus);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.call_count(), 0);
    assert_eq!(store.load_pending_events().await?.len(), 1);

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn restarted_bus_picks_up_where_the_stopped_one_left() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());

    let first = bus_with(&store);
    first.subscribe("orders", RecordingHandler::nacking(), &[1, 1], Duration::from_secs(60));
    let running = RunningBus::start(&first);
    first.publish("orders", b"order-1".to_vec()).await;
    assert!(wait_until(Duration::from_secs(1), || store.get(1).is_some_and(|r| r.retry == 1)).await);
    first.stop();
    running.join().await??;

    let second = bus_with(&store);
    let handler = RecordingHandler::acking();
    second.subscribe("orders", handler.clone(), &[1, 1], Duration::from_secs(60));
    let running = RunningBus::start(&second);

    assert!(handler.wait_for_acks(1, Duration::from_secs(1)).await);
    assert_eq!(handler.retries_seen(), vec![1]);
    assert!(
        wait_until(Duration::from_secs(1), || {
            store.count_by_status(OutboxStatus::Processed) == 1
        })
        .await
    );

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn event_published_before_start_is_delivered_once() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());
    let bus = bus_with(&store);
    let handler = RecordingHandler::acking();
    bus.subscribe("orders", handler.clone(), &[1], Duration::from_secs(60));

    bus.try_publish("orders", b"once".to_vec()).await?;
    let running = RunningBus::start(&bus);

    assert!(handler.wait_for_calls(1, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.payloads(), vec![b"once".to_vec()]);
    assert!(
        wait_until(Duration::from_secs(1), || {
            store.count_by_status(OutboxStatus::Processed) == 1
        })
        .await
    );

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn ack_on_last_scheduled_attempt_marks_record_failed() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());
    let bus = bus_with(&store);
    let handler = RecordingHandler::ack_from_retry(3);
    bus.subscribe("orders", handler.clone(), &[1, 1, 1], Duration::from_millis(5));

    bus.publish("orders", b"late".to_vec()).await;
    let running = RunningBus::start(&bus);

    assert!(
        wait_until(Duration::from_secs(2), || {
            store.count_by_status(OutboxStatus::Failed) == 1
        })
        .await
    );
    let record = store.get(1).expect("record should exist");
    assert_eq!(record.retry, 3);
    assert_eq!(handler.retries_seen(), vec![0, 1, 2, 3]);
    assert_eq!(handler.ack_count(), 1);
    assert_eq!(store.count_by_status(OutboxStatus::Processed), 0);

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn final_ack_can_be_recorded_as_processed() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());
    let config = BusConfig {
        final_ack_processed: true,
        ..BusConfig::default()
    };
    let bus = EventBus::builder()
        .config(config)
        .with_outbox(Arc::clone(&store))
        .build();
    let handler = RecordingHandler::ack_from_retry(3);
    bus.subscribe("orders", handler.clone(), &[1, 1, 1], Duration::from_millis(5));

    let running = RunningBus::start(&bus);
    bus.publish("orders", b"late".to_vec()).await;

    assert!(
        wait_until(Duration::from_secs(2), || {
            store.count_by_status(OutboxStatus::Processed) == 1
        })
        .await
    );
    assert_eq!(store.count_by_status(OutboxStatus::Failed), 0);
    assert_eq!(handler.retries_seen(), vec![0, 1, 2, 3]);

    running.shutdown().await??;
    Ok(())
}

#[tokio::test]
async fn retry_abandoned_by_cancelled_run_is_replayed_on_restart() -> Result<()> {
    let store = Arc::new(MemoryOutboxStore::new());
    let bus = bus_with(&store);
    let handler = RecordingHandler::ack_from_retry(1);
    bus.subscribe("orders", handler.clone(), &[1, 1], Duration::from_secs(60));

    let running = RunningBus::start(&bus);
    bus.publish("orders", b"parked".to_vec()).await;
    assert!(wait_until(Duration::from_secs(1), || store.get(1).is_some_and(|r| r.retry == 1)).await);
    running.shutdown().await??;
    // The retry task notices the cancellation on its own schedule.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let running = RunningBus::start(&bus);
    assert!(handler.wait_for_acks(1, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.retries_seen(), vec![0, 1]);
    assert!(
        wait_until(Duration::from_secs(1), || {
            store.count_by_status(OutboxStatus::Processed) == 1
        })
        .await
    );

    running.shutdown().await??;
    Ok(())
}
