// Maps hourly timestamps to canonical block heights via an Etherscan-style
// block explorer API (`getblocknobytime`, closest block at or before the
// timestamp). Explorer APIs rate-limit aggressively, so lookups go through a
// bounded exponential-backoff retry.

use crate::metrics;
use crate::reconciler::{BlockNumberEntity, FetchProvider, Reconciler};
use crate::stores::RecordStore;
use crate::types::{BlockNumberRecord, ChainId, UnixTime};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BASE_MS: u64 = 500;
const RETRY_ATTEMPTS: usize = 4;

/// Anything that can answer "which block height belongs to this hour",
/// blocking until the answer is reconciled. Implemented by the block-number
/// reconciler; stubbed in tests.
#[async_trait]
pub trait BlockNumberSource: Send + Sync {
    async fn get_block_number_when_ready(&self, timestamp: UnixTime) -> Result<u64>;
}

#[async_trait]
impl<P, S> BlockNumberSource for Reconciler<BlockNumberEntity, BlockNumberRecord, P, S>
where
    P: FetchProvider<BlockNumberEntity, BlockNumberRecord> + 'static,
    S: RecordStore<BlockNumberRecord> + 'static,
{
    async fn get_block_number_when_ready(&self, timestamp: UnixTime) -> Result<u64> {
        let records = self.get_data_when_ready(timestamp).await?;
        records
            .first()
            .map(|r| r.block_number)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no block number stored for {} at {}",
                    self.chain_id(),
                    timestamp
                )
            })
    }
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    message: String,
    result: String,
}

/// Explorer-backed block height lookups for one chain.
pub struct EtherscanBlockProvider {
    client: reqwest::Client,
    chain_id: ChainId,
    base_url: String,
    api_key: String,
}

impl EtherscanBlockProvider {
    pub fn new(chain_id: ChainId, base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            chain_id,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    /// Height of the youngest block mined at or before `timestamp`.
    pub async fn get_block_number_at(&self, timestamp: UnixTime) -> Result<u64> {
        let strategy = ExponentialBackoff::from_millis(RETRY_BASE_MS)
            .map(jitter)
            .take(RETRY_ATTEMPTS);
        Retry::spawn(strategy, || self.query_block_number(timestamp))
            .await
            .with_context(|| {
                format!(
                    "block number lookup failed for {} at {}",
                    self.chain_id, timestamp
                )
            })
    }

    async fn query_block_number(&self, timestamp: UnixTime) -> Result<u64> {
        metrics::increment_rpc_call("block_explorer");
        let url = format!(
            "{}?module=block&action=getblocknobytime&timestamp={}&closest=before&apikey={}",
            self.base_url,
            timestamp.as_secs(),
            self.api_key
        );
        let response = self.client.get(&url).send().await?;
        anyhow::ensure!(
            response.status().is_success(),
            "explorer returned HTTP {}",
            response.status()
        );
        let body: ExplorerResponse = response.json().await?;
        anyhow::ensure!(
            body.status == "1",
            "explorer error: {} ({})",
            body.message,
            body.result
        );
        let block_number = body
            .result
            .parse::<u64>()
            .with_context(|| format!("unparseable block number {:?}", body.result))?;
        debug!(
            "[{}] Block at {} is {}",
            self.chain_id, timestamp, block_number
        );
        Ok(block_number)
    }
}

#[async_trait]
impl FetchProvider<BlockNumberEntity, BlockNumberRecord> for EtherscanBlockProvider {
    async fn fetch(
        &self,
        missing: &[BlockNumberEntity],
        timestamp: UnixTime,
    ) -> Result<Vec<BlockNumberRecord>> {
        let mut records = Vec::with_capacity(missing.len());
        for entity in missing {
            let block_number = self.get_block_number_at(timestamp).await?;
            records.push(BlockNumberRecord {
                chain_id: entity.chain_id,
                timestamp,
                block_number,
            });
        }
        Ok(records)
    }
}
