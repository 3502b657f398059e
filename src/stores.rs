// Persistence seams for the reconcilers. The Postgres implementations live in
// `database`; the in-memory ones here back the tests and double as a cache for
// ad-hoc runs without a database.

use crate::config_hash::ConfigHash;
use crate::reconciler::ReconcilerRecord;
use crate::types::{ChainId, UnixTime};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Storage for one kind of timestamped record.
#[async_trait]
pub trait RecordStore<R: ReconcilerRecord>: Send + Sync {
    /// Inserts records, skipping any (chain, timestamp, key) already present.
    /// Reconciliation fills gaps; it never overwrites fetched history.
    /// Returns the number of records actually written.
    async fn add_or_update_many(&self, records: &[R]) -> Result<usize>;

    async fn get_by_timestamp(&self, chain_id: ChainId, timestamp: UnixTime) -> Result<Vec<R>>;
}

/// One reconciled (config, timestamp) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionStatus {
    pub config_hash: ConfigHash,
    pub timestamp: UnixTime,
    pub chain_id: ChainId,
    pub kind: String,
}

/// Storage for completion rows. Keyed by config hash so a changed tracked set
/// starts from a clean slate without touching old rows. Reconcilers over the
/// same entity list produce the same hash, so reads are additionally scoped by
/// chain and kind or one reconciler's rows would satisfy another's.
#[async_trait]
pub trait CompletionStore: Send + Sync {
    async fn get_by_config_hash(
        &self,
        config_hash: &ConfigHash,
        chain_id: ChainId,
        kind: &str,
    ) -> Result<Vec<UnixTime>>;

    /// Idempotent: recording the same (config, chain, kind, timestamp) twice
    /// keeps one row.
    async fn add(&self, status: CompletionStatus) -> Result<()>;
}

pub struct InMemoryRecordStore<R: ReconcilerRecord> {
    records: DashMap<(ChainId, i64), Vec<R>>,
}

impl<R: ReconcilerRecord> InMemoryRecordStore<R> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: DashMap::new(),
        })
    }
}

#[async_trait]
impl<R: ReconcilerRecord> RecordStore<R> for InMemoryRecordStore<R> {
    async fn add_or_update_many(&self, records: &[R]) -> Result<usize> {
        let mut written = 0;
        for record in records {
            let mut slot = self
                .records
                .entry((record.chain_id(), record.timestamp().as_secs()))
                .or_default();
            if !slot.iter().any(|r| r.key() == record.key()) {
                slot.push(record.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn get_by_timestamp(&self, chain_id: ChainId, timestamp: UnixTime) -> Result<Vec<R>> {
        Ok(self
            .records
            .get(&(chain_id, timestamp.as_secs()))
            .map(|slot| slot.value().clone())
            .unwrap_or_default())
    }
}

pub struct InMemoryCompletionStore {
    rows: DashMap<(ConfigHash, ChainId, String), HashSet<i64>>,
}

impl InMemoryCompletionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: DashMap::new(),
        })
    }

    pub fn row_count(&self) -> usize {
        self.rows.iter().map(|e| e.value().len()).sum()
    }
}

#[async_trait]
impl CompletionStore for InMemoryCompletionStore {
    async fn get_by_config_hash(
        &self,
        config_hash: &ConfigHash,
        chain_id: ChainId,
        kind: &str,
    ) -> Result<Vec<UnixTime>> {
        let mut timestamps: Vec<UnixTime> = self
            .rows
            .get(&(*config_hash, chain_id, kind.to_string()))
            .map(|set| set.iter().map(|s| UnixTime::from_secs(*s)).collect())
            .unwrap_or_default();
        timestamps.sort();
        Ok(timestamps)
    }

    async fn add(&self, status: CompletionStatus) -> Result<()> {
        self.rows
            .entry((status.config_hash, status.chain_id, status.kind))
            .or_default()
            .insert(status.timestamp.as_secs());
        Ok(())
    }
}
