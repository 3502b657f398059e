// Generic timestamped reconciler. One component, instantiated per data kind
// (block numbers, balances, prices, total supplies, value reports) with a
// fetch provider and a persistence store injected as collaborators.
//
// Per-timestamp state machine, scoped to one config hash:
//   Unknown -> Reconciling -> Known        (missing set empty, or fetch+persist ok)
//   Reconciling -> Unknown                 (fetch failed; retried on next trigger)

use crate::clock::{Clock, ClockHandle};
use crate::config_hash::{config_hash, ConfigHash};
use crate::metrics;
use crate::stores::{CompletionStatus, CompletionStore, RecordStore};
use crate::task_queue::TaskQueue;
use crate::types::{
    AssetId, BalanceRecord, BlockNumberRecord, ChainId, HeldAsset, PriceRecord, ReportRecord,
    TotalSupplyRecord, TrackedToken, UnixTime,
};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashSet;
use ethers::types::Address;
use log::{debug, info};
use serde::Serialize;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// A configured entity the reconciler must keep resolved for every hourly
/// timestamp at or after its activation.
pub trait ReconcilerEntity: Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
    fn since_timestamp(&self) -> UnixTime;
}

/// A persisted data point. Records and entities of one kind share a key type
/// so the missing-set computation can subtract one from the other.
pub trait ReconcilerRecord: Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
    fn chain_id(&self) -> ChainId;
    fn timestamp(&self) -> UnixTime;
}

/// Resolves exactly the requested entities at a timestamp, or fails the call
/// entirely. Partial failure handling lives inside the provider (e.g. the
/// multicall client's per-call success flags).
#[async_trait]
pub trait FetchProvider<E, R>: Send + Sync
where
    E: ReconcilerEntity,
    R: ReconcilerRecord,
{
    async fn fetch(&self, missing: &[E], timestamp: UnixTime) -> Result<Vec<R>>;
}

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

pub struct Reconciler<E, R, P, S>
where
    E: ReconcilerEntity,
    R: ReconcilerRecord<Key = E::Key>,
    P: FetchProvider<E, R>,
    S: RecordStore<R>,
{
    kind: &'static str,
    chain_id: ChainId,
    config_hash: ConfigHash,
    entities: Vec<E>,
    provider: Arc<P>,
    store: Arc<S>,
    completion_store: Arc<dyn CompletionStore>,
    clock: Arc<dyn Clock>,
    known_set: DashSet<i64>,
    task_queue: Arc<TaskQueue<UnixTime>>,
    refresh_interval: Duration,
    _record: std::marker::PhantomData<R>,
}

impl<E, R, P, S> Reconciler<E, R, P, S>
where
    E: ReconcilerEntity + Serialize,
    R: ReconcilerRecord<Key = E::Key>,
    P: FetchProvider<E, R> + 'static,
    S: RecordStore<R> + 'static,
{
    pub fn new(
        kind: &'static str,
        chain_id: ChainId,
        entities: Vec<E>,
        provider: Arc<P>,
        store: Arc<S>,
        completion_store: Arc<dyn CompletionStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let hash = config_hash(&entities)?;
        Ok(Self {
            kind,
            chain_id,
            config_hash: hash,
            entities,
            provider,
            store,
            completion_store,
            clock,
            known_set: DashSet::new(),
            task_queue: TaskQueue::new(kind),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            _record: std::marker::PhantomData,
        })
    }

    /// Overrides how often `get_data_when_ready` re-checks the known-set.
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn config_hash(&self) -> ConfigHash {
        self.config_hash
    }

    pub fn is_known(&self, timestamp: UnixTime) -> bool {
        self.known_set.contains(&timestamp.as_secs())
    }

    /// Seeds the known-set from persisted completion rows matching the
    /// current config hash, starts the queue worker and subscribes to the
    /// clock. Ticks for unknown timestamps go to the front of the queue so
    /// backfill runs newest-first.
    pub async fn start(self: &Arc<Self>) -> Result<ClockHandle> {
        let known = self
            .completion_store
            .get_by_config_hash(&self.config_hash, self.chain_id, self.kind)
            .await?;
        for timestamp in &known {
            self.known_set.insert(timestamp.as_secs());
        }

        let worker = Arc::clone(self);
        self.task_queue.start_worker(move |timestamp| {
            let worker = Arc::clone(&worker);
            Box::pin(async move { worker.update(timestamp).await })
        });

        info!(
            "[{}:{}] Started with {} known timestamps (config hash {})",
            self.kind,
            self.chain_id,
            known.len(),
            self.config_hash
        );

        let subscriber = Arc::clone(self);
        Ok(self.clock.on_every_hour(Box::new(move |timestamp| {
            if !subscriber.is_known(timestamp) {
                // Front insertion: sync from newest to oldest.
                subscriber.task_queue.push_front(timestamp);
            }
        })))
    }

    /// Reconciles one timestamp: compute the missing entity set against the
    /// current configuration, fetch and persist exactly that subset, then
    /// record completion. An empty missing set still completes the timestamp
    /// ("nothing to do" is a valid outcome, recorded so restarts skip it).
    pub async fn update(self: &Arc<Self>, timestamp: UnixTime) -> Result<()> {
        debug!("[{}:{}] Update started for {}", self.kind, self.chain_id, timestamp);

        let known = match self
            .store
            .get_by_timestamp(self.chain_id, timestamp)
            .await
        {
            Ok(known) => known,
            Err(e) => {
                metrics::increment_reconciler_update_failures(self.kind, self.chain_id.name());
                return Err(e);
            }
        };
        let missing = missing_entities(timestamp, &known, &self.entities);

        if !missing.is_empty() {
            let result = async {
                let records = self.provider.fetch(&missing, timestamp).await?;
                self.store.add_or_update_many(&records).await?;
                Ok::<_, anyhow::Error>(records.len())
            }
            .await;
            match result {
                Ok(count) => {
                    debug!(
                        "[{}:{}] Fetched {} records for {}",
                        self.kind, self.chain_id, count, timestamp
                    );
                }
                Err(e) => {
                    // No state transition: the timestamp stays unknown and is
                    // retried on the next clock tick or backfill pass.
                    metrics::increment_reconciler_update_failures(self.kind, self.chain_id.name());
                    return Err(e);
                }
            }
        } else {
            debug!(
                "[{}:{}] Nothing missing for {}",
                self.kind, self.chain_id, timestamp
            );
        }

        self.completion_store
            .add(CompletionStatus {
                config_hash: self.config_hash,
                timestamp,
                chain_id: self.chain_id,
                kind: self.kind.to_string(),
            })
            .await?;
        self.known_set.insert(timestamp.as_secs());
        metrics::increment_reconciler_updates(self.kind, self.chain_id.name());
        info!(
            "[{}:{}] Update completed for {}",
            self.kind, self.chain_id, timestamp
        );
        Ok(())
    }

    /// Blocks the calling task until `timestamp` is known under the current
    /// config hash, then returns its persisted records. Bounded-interval
    /// polling: simple, restart-safe and cheap at hourly cadence.
    pub async fn get_data_when_ready(&self, timestamp: UnixTime) -> Result<Vec<R>> {
        while !self.is_known(timestamp) {
            tokio::time::sleep(self.refresh_interval).await;
        }
        self.store.get_by_timestamp(self.chain_id, timestamp).await
    }
}

/// Entities required at `timestamp` (activation reached) that have no
/// persisted record yet. Entities activating after the timestamp are not
/// missing, they are simply out of scope for that hour.
pub fn missing_entities<E, R>(timestamp: UnixTime, known: &[R], entities: &[E]) -> Vec<E>
where
    E: ReconcilerEntity,
    R: ReconcilerRecord<Key = E::Key>,
{
    let known_keys: HashSet<E::Key> = known.iter().map(|r| r.key()).collect();
    entities
        .iter()
        .filter(|e| !e.since_timestamp().gt(&timestamp))
        .filter(|e| !known_keys.contains(&e.key()))
        .cloned()
        .collect()
}

// Trait wiring for the built-in data kinds.

impl ReconcilerEntity for HeldAsset {
    type Key = (Address, AssetId);

    fn key(&self) -> Self::Key {
        (self.holder, self.token.asset_id.clone())
    }

    fn since_timestamp(&self) -> UnixTime {
        self.since_timestamp
    }
}

impl ReconcilerRecord for BalanceRecord {
    type Key = (Address, AssetId);

    fn key(&self) -> Self::Key {
        (self.holder, self.asset_id.clone())
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn timestamp(&self) -> UnixTime {
        self.timestamp
    }
}

impl ReconcilerEntity for TrackedToken {
    type Key = AssetId;

    fn key(&self) -> Self::Key {
        self.asset_id.clone()
    }

    fn since_timestamp(&self) -> UnixTime {
        self.since_timestamp
    }
}

impl ReconcilerRecord for TotalSupplyRecord {
    type Key = AssetId;

    fn key(&self) -> Self::Key {
        self.asset_id.clone()
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn timestamp(&self) -> UnixTime {
        self.timestamp
    }
}

impl ReconcilerRecord for PriceRecord {
    type Key = AssetId;

    fn key(&self) -> Self::Key {
        self.asset_id.clone()
    }

    fn chain_id(&self) -> ChainId {
        ChainId::OFFCHAIN
    }

    fn timestamp(&self) -> UnixTime {
        self.timestamp
    }
}

impl ReconcilerRecord for ReportRecord {
    type Key = AssetId;

    fn key(&self) -> Self::Key {
        self.asset_id.clone()
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn timestamp(&self) -> UnixTime {
        self.timestamp
    }
}

/// Marker entity for the block-number reconciler: one pseudo-entity per
/// chain, so every hour resolves exactly one block height.
#[derive(Debug, Clone, Serialize)]
pub struct BlockNumberEntity {
    pub chain_id: ChainId,
    pub since_timestamp: UnixTime,
}

impl ReconcilerEntity for BlockNumberEntity {
    type Key = ChainId;

    fn key(&self) -> Self::Key {
        self.chain_id
    }

    fn since_timestamp(&self) -> UnixTime {
        self.since_timestamp
    }
}

impl ReconcilerRecord for BlockNumberRecord {
    type Key = ChainId;

    fn key(&self) -> Self::Key {
        self.chain_id
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn timestamp(&self) -> UnixTime {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::ManualClock;
    use crate::stores::{InMemoryCompletionStore, InMemoryRecordStore};
    use crate::types::ValueFormula;
    use ethers::types::U256;
    use std::sync::Mutex;

    fn token(id: &str, since: i64) -> TrackedToken {
        TrackedToken {
            asset_id: AssetId::new(id),
            address: Some(Address::repeat_byte(0x42)),
            decimals: 18,
            since_timestamp: UnixTime(since),
            formula: ValueFormula::TotalSupply,
        }
    }

    fn supply_record(id: &str, ts: i64, supply: u64) -> TotalSupplyRecord {
        TotalSupplyRecord {
            chain_id: ChainId::ETHEREUM,
            timestamp: UnixTime(ts),
            asset_id: AssetId::new(id),
            total_supply: U256::from(supply),
        }
    }

    /// Provider that resolves every requested token with a fixed supply and
    /// records which entity sets it was asked for.
    struct StubProvider {
        fetches: Mutex<Vec<(Vec<AssetId>, UnixTime)>>,
        fail: Mutex<bool>,
    }

    impl StubProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fetches: Mutex::new(Vec::new()),
                fail: Mutex::new(false),
            })
        }

        fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        fn fetch_count(&self) -> usize {
            self.fetches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl FetchProvider<TrackedToken, TotalSupplyRecord> for StubProvider {
        async fn fetch(
            &self,
            missing: &[TrackedToken],
            timestamp: UnixTime,
        ) -> Result<Vec<TotalSupplyRecord>> {
            anyhow::ensure!(!*self.fail.lock().unwrap(), "provider down");
            self.fetches.lock().unwrap().push((
                missing.iter().map(|t| t.asset_id.clone()).collect(),
                timestamp,
            ));
            Ok(missing
                .iter()
                .map(|t| TotalSupplyRecord {
                    chain_id: ChainId::ETHEREUM,
                    timestamp,
                    asset_id: t.asset_id.clone(),
                    total_supply: U256::from(1_000u64),
                })
                .collect())
        }
    }

    type TestReconciler =
        Reconciler<TrackedToken, TotalSupplyRecord, StubProvider, InMemoryRecordStore<TotalSupplyRecord>>;

    fn reconciler(
        entities: Vec<TrackedToken>,
        provider: Arc<StubProvider>,
        store: Arc<InMemoryRecordStore<TotalSupplyRecord>>,
        completion: Arc<InMemoryCompletionStore>,
        clock: Arc<dyn Clock>,
    ) -> Arc<TestReconciler> {
        Arc::new(
            Reconciler::new(
                "total_supply",
                ChainId::ETHEREUM,
                entities,
                provider,
                store,
                completion,
                clock,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_missing_excludes_inactive_and_known() {
        let entities = vec![token("old", 0), token("new", 100)];
        let known = vec![supply_record("old", 50, 7)];

        // Entity active at T=100 must not appear in the missing set at T=50.
        let missing = missing_entities(UnixTime(50), &known, &entities);
        assert!(missing.is_empty());

        let missing = missing_entities::<_, TotalSupplyRecord>(UnixTime(100), &[], &entities);
        assert_eq!(missing.len(), 2);
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let provider = StubProvider::new();
        let store = InMemoryRecordStore::new();
        let completion = InMemoryCompletionStore::new();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock { ticks: vec![] });
        let rec = reconciler(
            vec![token("arbitrum", 0)],
            Arc::clone(&provider),
            Arc::clone(&store),
            Arc::clone(&completion),
            clock,
        );

        let ts = UnixTime(3_600);
        rec.update(ts).await.unwrap();
        rec.update(ts).await.unwrap();

        // Second update found nothing missing: one fetch, one completion row.
        assert_eq!(provider.fetch_count(), 1);
        assert_eq!(completion.row_count(), 1);
        let rows = store.get_by_timestamp(ChainId::ETHEREUM, ts).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_missing_set_still_marks_known() {
        let provider = StubProvider::new();
        let store = InMemoryRecordStore::new();
        let completion = InMemoryCompletionStore::new();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock { ticks: vec![] });
        // Token activates at T=7200; at T=3600 there is vacuously nothing to do.
        let rec = reconciler(
            vec![token("arbitrum", 7_200)],
            Arc::clone(&provider),
            store,
            Arc::clone(&completion),
            clock,
        );

        rec.update(UnixTime(3_600)).await.unwrap();

        assert_eq!(provider.fetch_count(), 0);
        assert!(rec.is_known(UnixTime(3_600)));
        assert_eq!(completion.row_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_timestamp_unknown() {
        let provider = StubProvider::new();
        let store = InMemoryRecordStore::new();
        let completion = InMemoryCompletionStore::new();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock { ticks: vec![] });
        let rec = reconciler(
            vec![token("arbitrum", 0)],
            Arc::clone(&provider),
            store,
            Arc::clone(&completion),
            clock,
        );

        provider.set_fail(true);
        assert!(rec.update(UnixTime(3_600)).await.is_err());
        assert!(!rec.is_known(UnixTime(3_600)));
        assert_eq!(completion.row_count(), 0);

        // Retry after the provider recovers succeeds normally.
        provider.set_fail(false);
        rec.update(UnixTime(3_600)).await.unwrap();
        assert!(rec.is_known(UnixTime(3_600)));
    }

    #[tokio::test]
    async fn test_start_seeds_known_set_and_skips_known_ticks() {
        let provider = StubProvider::new();
        let store = InMemoryRecordStore::new();
        let completion = InMemoryCompletionStore::new();

        // Persist completion for T=3600 under the hash this config produces.
        let entities = vec![token("arbitrum", 0)];
        let hash = config_hash(&entities).unwrap();
        completion
            .add(CompletionStatus {
                config_hash: hash,
                timestamp: UnixTime(3_600),
                chain_id: ChainId::ETHEREUM,
                kind: "total_supply".to_string(),
            })
            .await
            .unwrap();

        let clock: Arc<dyn Clock> = Arc::new(ManualClock {
            ticks: vec![UnixTime(3_600), UnixTime(7_200)],
        });
        let rec = reconciler(entities, Arc::clone(&provider), store, completion, clock);

        let _handle = rec.start().await.unwrap();

        // Only the unknown tick (7200) reaches the provider.
        for _ in 0..50 {
            if rec.is_known(UnixTime(7_200)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(rec.is_known(UnixTime(7_200)));
        let fetches = provider.fetches.lock().unwrap();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].1, UnixTime(7_200));
    }

    #[tokio::test]
    async fn test_completion_under_other_hash_does_not_satisfy_readiness() {
        let provider = StubProvider::new();
        let store = InMemoryRecordStore::new();
        let completion = InMemoryCompletionStore::new();

        // Completion row recorded under a different tracked set.
        let other_hash = config_hash(&[token("dai", 0)]).unwrap();
        completion
            .add(CompletionStatus {
                config_hash: other_hash,
                timestamp: UnixTime(3_600),
                chain_id: ChainId::ETHEREUM,
                kind: "total_supply".to_string(),
            })
            .await
            .unwrap();

        let clock: Arc<dyn Clock> = Arc::new(ManualClock { ticks: vec![] });
        let rec = reconciler(
            vec![token("arbitrum", 0)],
            provider,
            store,
            completion,
            clock,
        );
        let _handle = rec.start().await.unwrap();

        assert!(!rec.is_known(UnixTime(3_600)));
    }

    #[tokio::test]
    async fn test_completion_of_other_kind_does_not_seed_known_set() {
        // A supply-only chain reports on the same token list it tracks, so
        // both reconcilers hash to the same fingerprint. Restart seeding must
        // stay scoped to the reconciler's own kind and chain.
        let entities = vec![token("arbitrum", 0)];
        let completion = InMemoryCompletionStore::new();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock { ticks: vec![] });

        let supplies = reconciler(
            entities.clone(),
            StubProvider::new(),
            InMemoryRecordStore::new(),
            Arc::clone(&completion),
            Arc::clone(&clock),
        );
        supplies.update(UnixTime(3_600)).await.unwrap();
        assert_eq!(completion.row_count(), 1);

        let reports: Arc<TestReconciler> = Arc::new(
            Reconciler::new(
                "report",
                ChainId::ETHEREUM,
                entities.clone(),
                StubProvider::new(),
                InMemoryRecordStore::new(),
                Arc::clone(&completion) as Arc<dyn CompletionStore>,
                Arc::clone(&clock),
            )
            .unwrap(),
        );
        assert_eq!(reports.config_hash(), supplies.config_hash());
        let _handle = reports.start().await.unwrap();
        assert!(!reports.is_known(UnixTime(3_600)));

        let other_chain: Arc<TestReconciler> = Arc::new(
            Reconciler::new(
                "total_supply",
                ChainId::ARBITRUM,
                entities,
                StubProvider::new(),
                InMemoryRecordStore::new(),
                completion,
                clock,
            )
            .unwrap(),
        );
        let _handle = other_chain.start().await.unwrap();
        assert!(!other_chain.is_known(UnixTime(3_600)));
    }

    #[tokio::test]
    async fn test_refresh_interval_is_tunable() {
        let provider = StubProvider::new();
        let store = InMemoryRecordStore::new();
        let completion = InMemoryCompletionStore::new();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock { ticks: vec![] });
        let rec: Arc<TestReconciler> = Arc::new(
            Reconciler::new(
                "total_supply",
                ChainId::ETHEREUM,
                vec![token("arbitrum", 0)],
                provider,
                store,
                completion,
                clock,
            )
            .unwrap()
            .with_refresh_interval(Duration::from_millis(5)),
        );

        let ts = UnixTime(3_600);
        let waiter = Arc::clone(&rec);
        let wait = tokio::spawn(async move { waiter.get_data_when_ready(ts).await });
        // Let the waiter enter its polling loop before the data shows up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        rec.update(ts).await.unwrap();

        // At the default 1s interval this would outlast the timeout.
        let rows = tokio::time::timeout(Duration::from_millis(500), wait)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_get_data_when_ready_blocks_until_known() {
        let provider = StubProvider::new();
        let store = InMemoryRecordStore::new();
        let completion = InMemoryCompletionStore::new();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock { ticks: vec![] });
        let rec = reconciler(
            vec![token("arbitrum", 0)],
            provider,
            store,
            completion,
            clock,
        );

        let waiter = Arc::clone(&rec);
        let wait = tokio::spawn(async move { waiter.get_data_when_ready(UnixTime(3_600)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!wait.is_finished());

        rec.update(UnixTime(3_600)).await.unwrap();
        let rows = tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
