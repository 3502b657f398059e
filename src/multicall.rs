use crate::ethereum_client::CallProvider;
use crate::metrics;
use crate::types::ChainId;
use anyhow::Result;
use ethers::abi::{self, Function, Param, ParamType, StateMutability, Token};
use ethers::types::{Address, Bytes};
use futures::stream::{self, StreamExt, TryStreamExt};
use indexmap::IndexMap;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Malformed aggregation contract responses. Distinct from per-call failure,
/// which is in-band data.
#[derive(Debug, Error)]
pub enum MulticallDecodeError {
    #[error("abi decoding failed: {0}")]
    Abi(#[from] abi::Error),
    #[error("unexpected aggregate response shape")]
    InvalidV1,
    #[error("unexpected tryAggregate response shape")]
    InvalidV2,
}

/// Upper bound on calls aggregated into one round trip. Tunable per client;
/// this default keeps calldata and response sizes within what public RPC
/// providers accept.
pub const MULTICALL_BATCH_SIZE: usize = 150;

/// How many individual `eth_call`s run concurrently when no aggregation
/// contract is deployed yet at the queried block.
pub const INDIVIDUAL_CALL_CONCURRENCY: usize = 10;

/// A single read-only call to be aggregated in a multicall round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticallRequest {
    pub address: Address,
    pub data: Bytes,
}

/// Per-call outcome. `success=false` is data, not an error: the call reverted
/// or returned nothing, and the rest of the batch is unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticallResponse {
    pub success: bool,
    pub data: Bytes,
}

impl MulticallResponse {
    fn failure() -> Self {
        MulticallResponse {
            success: false,
            data: Bytes::default(),
        }
    }
}

/// On-chain aggregation contract encodings. Selection is a pure block-height
/// threshold lookup, never a runtime capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MulticallVersion {
    /// `aggregate((address,bytes)[])`: the whole batch reverts if any single
    /// call fails, so an all-success response is the only legal decode.
    V1,
    /// `tryAggregate(bool,(address,bytes)[])`: per-call `(success, data)`
    /// tuples, partial failure within a batch is representable.
    V2,
}

/// One row of the static per-chain dispatch table: which aggregation contract
/// is live at or above `since_block`. New chains and forks add a row here,
/// not new branching logic.
#[derive(Debug, Clone, Deserialize)]
pub struct MulticallConfigEntry {
    pub since_block: u64,
    pub address: Address,
    pub version: MulticallVersion,
}

/// Ethereum mainnet deployment history: V1 first, V2 later.
pub fn ethereum_multicall_config() -> Vec<MulticallConfigEntry> {
    vec![
        MulticallConfigEntry {
            since_block: 7_929_876,
            address: "0xeefBa1e63905eF1D7ACbA5a8513c70307C1cE441"
                .parse()
                .expect("const address"),
            version: MulticallVersion::V1,
        },
        MulticallConfigEntry {
            since_block: 12_336_033,
            address: "0x5BA1e12693Dc8F9c48aAD8770482f4739bEeD696"
                .parse()
                .expect("const address"),
            version: MulticallVersion::V2,
        },
    ]
}

/// Arbitrum shipped a first-party V2-style aggregator from early on; there is
/// no legacy fallback, only the individual-call path below its deployment.
pub fn arbitrum_multicall_config() -> Vec<MulticallConfigEntry> {
    vec![MulticallConfigEntry {
        since_block: 821_923,
        address: "0x842eC2c7D803033Edf55E478F461FC547Bc54EB2"
            .parse()
            .expect("const address"),
        version: MulticallVersion::V2,
    }]
}

/// Batches many independent read-only calls at a block height into the
/// minimum number of round trips, using whichever aggregation contract the
/// dispatch table marks live at that height.
pub struct MulticallClient<C: CallProvider> {
    client: Arc<C>,
    /// Sorted descending by `since_block`; first entry at or below the
    /// queried block wins.
    entries: Vec<MulticallConfigEntry>,
    batch_size: usize,
    individual_concurrency: usize,
}

impl<C: CallProvider + 'static> MulticallClient<C> {
    pub fn new(
        client: Arc<C>,
        chain_id: ChainId,
        mut entries: Vec<MulticallConfigEntry>,
    ) -> Result<Self> {
        anyhow::ensure!(
            client.chain_id() == chain_id,
            "multicall client configured for {} but RPC client is {}",
            chain_id,
            client.chain_id()
        );
        entries.sort_by(|a, b| b.since_block.cmp(&a.since_block));
        Ok(Self {
            client,
            entries,
            batch_size: MULTICALL_BATCH_SIZE,
            individual_concurrency: INDIVIDUAL_CALL_CONCURRENCY,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn chain_id(&self) -> ChainId {
        self.client.chain_id()
    }

    /// The aggregation contract live at `block_number`, if any. Also used by
    /// providers that need the aggregator's own helpers (e.g. native balance
    /// lookups via `getEthBalance`).
    pub fn entry_for(&self, block_number: u64) -> Option<&MulticallConfigEntry> {
        self.entries.iter().find(|e| block_number >= e.since_block)
    }

    /// Executes `requests` at `block_number`. The result has the same order
    /// and length as the input; per-call failures are reported in-band while
    /// a transport failure for any round trip propagates as an error.
    pub async fn multicall(
        &self,
        requests: Vec<MulticallRequest>,
        block_number: u64,
    ) -> Result<Vec<MulticallResponse>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let entry = match self.entry_for(block_number) {
            Some(entry) => entry,
            None => {
                debug!(
                    "No aggregation contract at block {}, falling back to {} individual calls",
                    block_number,
                    requests.len()
                );
                return self.execute_individual(&requests, block_number).await;
            }
        };

        // Owned batches: borrowing the request slice across `buffered` trips
        // over the async-trait lifetime erasure.
        let batches: Vec<Vec<MulticallRequest>> = requests
            .chunks(self.batch_size)
            .map(<[MulticallRequest]>::to_vec)
            .collect();
        let results = stream::iter(batches)
            .map(|batch| async move { self.execute_batch(entry, &batch, block_number).await })
            .buffered(4)
            .try_collect::<Vec<Vec<MulticallResponse>>>()
            .await?;
        Ok(results.into_iter().flatten().collect())
    }

    /// Convenience wrapper preserving key association.
    pub async fn multicall_named(
        &self,
        requests: IndexMap<String, MulticallRequest>,
        block_number: u64,
    ) -> Result<HashMap<String, MulticallResponse>> {
        let (keys, calls): (Vec<String>, Vec<MulticallRequest>) = requests.into_iter().unzip();
        let results = self.multicall(calls, block_number).await?;
        Ok(keys.into_iter().zip(results).collect())
    }

    async fn execute_batch(
        &self,
        entry: &MulticallConfigEntry,
        batch: &[MulticallRequest],
        block_number: u64,
    ) -> Result<Vec<MulticallResponse>> {
        metrics::record_multicall_batch_size(batch.len() as f64);
        match entry.version {
            MulticallVersion::V1 => {
                let calldata = encode_multicall_v1(batch)?;
                let raw = self
                    .client
                    .call(entry.address, calldata, block_number)
                    .await?;
                let decoded = decode_multicall_v1(&raw)?;
                if decoded.len() != batch.len() {
                    // The legacy contract reverts the whole batch on any
                    // failure; report every call as failed and let the
                    // reconciler retry the timestamp.
                    warn!(
                        "Legacy multicall batch of {} at block {} reverted entirely",
                        batch.len(),
                        block_number
                    );
                    return Ok(vec![MulticallResponse::failure(); batch.len()]);
                }
                Ok(decoded)
            }
            MulticallVersion::V2 => {
                let calldata = encode_multicall_v2(batch)?;
                let raw = self
                    .client
                    .call(entry.address, calldata, block_number)
                    .await?;
                let decoded = decode_multicall_v2(&raw)?;
                anyhow::ensure!(
                    decoded.len() == batch.len(),
                    "tryAggregate returned {} results for {} calls",
                    decoded.len(),
                    batch.len()
                );
                Ok(decoded)
            }
        }
    }

    async fn execute_individual(
        &self,
        requests: &[MulticallRequest],
        block_number: u64,
    ) -> Result<Vec<MulticallResponse>> {
        let results = stream::iter(requests.iter().cloned())
            .map(|request| {
                let client = Arc::clone(&self.client);
                async move { client.call(request.address, request.data, block_number).await }
            })
            .buffered(self.individual_concurrency)
            .try_collect::<Vec<Bytes>>()
            .await?;
        Ok(results
            .into_iter()
            .map(|data| MulticallResponse {
                success: !data.is_empty(),
                data,
            })
            .collect())
    }
}

fn call_tuples(requests: &[MulticallRequest]) -> Token {
    Token::Array(
        requests
            .iter()
            .map(|r| Token::Tuple(vec![Token::Address(r.address), Token::Bytes(r.data.to_vec())]))
            .collect(),
    )
}

#[allow(deprecated)]
fn aggregate_function() -> Function {
    // function aggregate(tuple(address,bytes)[] calls)
    //     returns (uint256 blockNumber, bytes[] returnData)
    Function {
        name: "aggregate".to_string(),
        inputs: vec![Param {
            name: "calls".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Address,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        outputs: vec![
            Param {
                name: "blockNumber".to_string(),
                kind: ParamType::Uint(256),
                internal_type: None,
            },
            Param {
                name: "returnData".to_string(),
                kind: ParamType::Array(Box::new(ParamType::Bytes)),
                internal_type: None,
            },
        ],
        constant: None,
        state_mutability: StateMutability::NonPayable,
    }
}

#[allow(deprecated)]
fn try_aggregate_function() -> Function {
    // function tryAggregate(bool requireSuccess, tuple(address,bytes)[] calls)
    //     returns (tuple(bool,bytes)[] returnData)
    Function {
        name: "tryAggregate".to_string(),
        inputs: vec![
            Param {
                name: "requireSuccess".to_string(),
                kind: ParamType::Bool,
                internal_type: None,
            },
            Param {
                name: "calls".to_string(),
                kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                    ParamType::Address,
                    ParamType::Bytes,
                ]))),
                internal_type: None,
            },
        ],
        outputs: vec![Param {
            name: "returnData".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::NonPayable,
    }
}

pub fn encode_multicall_v1(requests: &[MulticallRequest]) -> Result<Bytes> {
    let calldata = aggregate_function().encode_input(&[call_tuples(requests)])?;
    Ok(Bytes::from(calldata))
}

/// Decodes a legacy `aggregate` response. An empty return means the whole
/// batch reverted and yields an empty list, never a partial one; a non-empty
/// return is by construction all-success.
pub fn decode_multicall_v1(raw: &Bytes) -> Result<Vec<MulticallResponse>, MulticallDecodeError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let decoded = abi::decode(
        &[
            ParamType::Uint(256),
            ParamType::Array(Box::new(ParamType::Bytes)),
        ],
        raw,
    )?;
    let values = decoded
        .into_iter()
        .nth(1)
        .and_then(|t| t.into_array())
        .ok_or(MulticallDecodeError::InvalidV1)?;
    values
        .into_iter()
        .map(|token| {
            let data = token.into_bytes().ok_or(MulticallDecodeError::InvalidV1)?;
            Ok(MulticallResponse {
                success: !data.is_empty(),
                data: Bytes::from(data),
            })
        })
        .collect()
}

pub fn encode_multicall_v2(requests: &[MulticallRequest]) -> Result<Bytes> {
    let calldata =
        try_aggregate_function().encode_input(&[Token::Bool(false), call_tuples(requests)])?;
    Ok(Bytes::from(calldata))
}

/// Decodes a `tryAggregate` response into per-call `(success, data)` pairs.
/// A success flag with empty data still counts as failure.
pub fn decode_multicall_v2(raw: &Bytes) -> Result<Vec<MulticallResponse>, MulticallDecodeError> {
    let decoded = abi::decode(
        &[ParamType::Array(Box::new(ParamType::Tuple(vec![
            ParamType::Bool,
            ParamType::Bytes,
        ])))],
        raw,
    )?;
    let values = decoded
        .into_iter()
        .next()
        .and_then(|t| t.into_array())
        .ok_or(MulticallDecodeError::InvalidV2)?;
    values
        .into_iter()
        .map(|token| {
            let mut tuple = token.into_tuple().ok_or(MulticallDecodeError::InvalidV2)?;
            if tuple.len() != 2 {
                return Err(MulticallDecodeError::InvalidV2);
            }
            let data = tuple
                .remove(1)
                .into_bytes()
                .ok_or(MulticallDecodeError::InvalidV2)?;
            let success = tuple
                .remove(0)
                .into_bool()
                .ok_or(MulticallDecodeError::InvalidV2)?;
            Ok(MulticallResponse {
                success: success && !data.is_empty(),
                data: Bytes::from(data),
            })
        })
        .collect()
}
