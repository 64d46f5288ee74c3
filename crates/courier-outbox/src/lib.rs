//! In-memory outbox store for the courier event bus.
//!
//! [`MemoryOutboxStore`] keeps outbox records in process memory with the
//! same semantics as the PostgreSQL store: ids are assigned on first insert,
//! `(data, topic)` is unique and a repeated insert updates the existing
//! record in place.
//!
//! It does not survive a restart of the process, which makes it a fit for
//! tests, demos, and for sharing one store between a stopped bus and its
//! replacement inside the same process.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use courier::EventBus;
//! use courier_outbox::MemoryOutboxStore;
//!
//! let store = Arc::new(MemoryOutboxStore::new());
//! let bus = EventBus::builder().with_outbox(Arc::clone(&store)).build();
//! ```

use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use courier::{OutboxRecord, OutboxStatus, OutboxStore};
use dashmap::DashMap;

type Key = (Vec<u8>, String);

/// Outbox store backed by concurrent hash maps.
#[derive(Debug)]
pub struct MemoryOutboxStore {
    records: DashMap<i64, OutboxRecord>,
    by_content: DashMap<Key, i64>,
    next_id: AtomicI64,
}

impl Default for MemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            by_content: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn get(&self, id: i64) -> Option<OutboxRecord> {
        self.records.get(&id).map(|record| record.value().clone())
    }

    /// All records ordered by id.
    pub fn records(&self) -> Vec<OutboxRecord> {
        let mut records: Vec<OutboxRecord> = self
            .records
            .iter()
            .map(|record| record.value().clone())
            .collect();
        records.sort_by_key(|record| record.id);
        records
    }

    pub fn count_by_status(&self, status: OutboxStatus) -> usize {
        self.records
            .iter()
            .filter(|record| record.ack_status == status)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn set_status(&self, id: i64, status: OutboxStatus) -> Result<()> {
        let Some(mut record) = self.records.get_mut(&id) else {
            bail!("outbox event {id} not found");
        };
        record.ack_status = status;
        record.updated_at = Utc::now().timestamp();
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn insert_event(&self, record: &OutboxRecord) -> Result<OutboxRecord> {
        let key = (record.data.clone(), record.topic.clone());

        // The content index shard stays locked until the record is written,
        // so concurrent inserts of the same pair cannot both allocate an id.
        let entry = self.by_content.entry(key).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.records.insert(
                id,
                OutboxRecord {
                    id,
                    ..record.clone()
                },
            );
            id
        });
        let id = *entry.value();

        let mut stored = self
            .records
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("outbox event {id} vanished during insert"))?;
        stored.retry = record.retry;
        stored.next_retry = record.next_retry;
        stored.ack_status = record.ack_status;
        stored.updated_at = record.updated_at;
        let stored = stored.clone();
        drop(entry);

        Ok(stored)
    }

    async fn load_pending_events(&self) -> Result<Vec<OutboxRecord>> {
        Ok(self
            .records()
            .into_iter()
            .filter(|record| record.ack_status == OutboxStatus::Pending)
            .collect())
    }

    async fn update_event_status(&self, record: &OutboxRecord) -> Result<()> {
        let Some(mut stored) = self.records.get_mut(&record.id) else {
            bail!("outbox event {} not found", record.id);
        };
        stored.retry = record.retry;
        stored.next_retry = record.next_retry;
        stored.ack_status = record.ack_status;
        stored.updated_at = Utc::now().timestamp();
        Ok(())
    }

    async fn mark_event_as_processed(&self, id: i64) -> Result<()> {
        self.set_status(id, OutboxStatus::Processed)
    }

    async fn mark_event_as_failed(&self, id: i64) -> Result<()> {
        self.set_status(id, OutboxStatus::Failed)
    }
}
