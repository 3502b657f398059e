// Resolves circulating `totalSupply()` for tracked tokens at the block height
// reconciled for a timestamp.

use crate::balance_provider::decode_uint;
use crate::block_number_provider::BlockNumberSource;
use crate::ethereum_client::CallProvider;
use crate::multicall::{MulticallClient, MulticallRequest};
use crate::reconciler::FetchProvider;
use crate::types::{ChainId, TotalSupplyRecord, TrackedToken, UnixTime};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::abi::{Function, Param, ParamType, StateMutability};
use ethers::types::Bytes;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use std::sync::Arc;

pub struct TotalSupplyProvider<C: CallProvider> {
    multicall: Arc<MulticallClient<C>>,
    block_numbers: Arc<dyn BlockNumberSource>,
    chain_id: ChainId,
}

impl<C: CallProvider + 'static> TotalSupplyProvider<C> {
    pub fn new(
        multicall: Arc<MulticallClient<C>>,
        block_numbers: Arc<dyn BlockNumberSource>,
    ) -> Self {
        let chain_id = multicall.chain_id();
        Self {
            multicall,
            block_numbers,
            chain_id,
        }
    }
}

#[async_trait]
impl<C: CallProvider + 'static> FetchProvider<TrackedToken, TotalSupplyRecord>
    for TotalSupplyProvider<C>
{
    async fn fetch(
        &self,
        missing: &[TrackedToken],
        timestamp: UnixTime,
    ) -> Result<Vec<TotalSupplyRecord>> {
        let block_number = self
            .block_numbers
            .get_block_number_when_ready(timestamp)
            .await?;

        let mut requests = IndexMap::with_capacity(missing.len());
        for token in missing {
            let address = token.address.ok_or_else(|| {
                anyhow::anyhow!(
                    "asset {} has no contract address, totalSupply is undefined",
                    token.asset_id
                )
            })?;
            requests.insert(
                token.asset_id.as_str().to_string(),
                MulticallRequest {
                    address,
                    data: encode_total_supply(),
                },
            );
        }
        let responses = self
            .multicall
            .multicall_named(requests, block_number)
            .await?;

        missing
            .iter()
            .map(|token| {
                let response = responses.get(token.asset_id.as_str()).ok_or_else(|| {
                    anyhow::anyhow!("no multicall response for asset {}", token.asset_id)
                })?;
                anyhow::ensure!(
                    response.success,
                    "totalSupply call failed for asset {} at block {}",
                    token.asset_id,
                    block_number
                );
                let total_supply = decode_uint(&response.data).with_context(|| {
                    format!("undecodable totalSupply for asset {}", token.asset_id)
                })?;
                Ok(TotalSupplyRecord {
                    chain_id: self.chain_id,
                    timestamp,
                    asset_id: token.asset_id.clone(),
                    total_supply,
                })
            })
            .collect()
    }
}

#[allow(deprecated)]
static TOTAL_SUPPLY_FUNCTION: Lazy<Function> = Lazy::new(|| {
    // function totalSupply() returns (uint256)
    Function {
        name: "totalSupply".to_string(),
        inputs: vec![],
        outputs: vec![Param {
            name: "supply".to_string(),
            kind: ParamType::Uint(256),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::View,
    }
});

pub fn encode_total_supply() -> Bytes {
    Bytes::from(TOTAL_SUPPLY_FUNCTION.short_signature().to_vec())
}
