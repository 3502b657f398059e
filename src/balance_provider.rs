// Resolves (holder, asset) balances at the block height reconciled for a
// timestamp. ERC-20 balances go through `balanceOf`; the chain's native asset
// goes through the aggregation contract's `getEthBalance` helper, so all
// lookups ride the same batched round trips.

use crate::block_number_provider::BlockNumberSource;
use crate::ethereum_client::CallProvider;
use crate::multicall::{MulticallClient, MulticallRequest};
use crate::reconciler::FetchProvider;
use crate::types::{BalanceRecord, ChainId, HeldAsset, UnixTime};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::abi::{self, Function, Param, ParamType, StateMutability, Token};
use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;

pub struct BalanceProvider<C: CallProvider> {
    multicall: Arc<MulticallClient<C>>,
    block_numbers: Arc<dyn BlockNumberSource>,
    chain_id: ChainId,
}

impl<C: CallProvider + 'static> BalanceProvider<C> {
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

    fn encode_request(&self, held: &HeldAsset, block_number: u64) -> Result<MulticallRequest> {
        match held.token.address {
            Some(token_address) => Ok(MulticallRequest {
                address: token_address,
                data: encode_balance_of(held.holder)?,
            }),
            None => {
                // Native balances have no contract to call; the aggregator's
                // helper is the only batched path.
                let entry = self.multicall.entry_for(block_number).ok_or_else(|| {
                    anyhow::anyhow!(
                        "native balance for {} requires an aggregation contract at block {}",
                        held.token.asset_id,
                        block_number
                    )
                })?;
                Ok(MulticallRequest {
                    address: entry.address,
                    data: encode_get_eth_balance(held.holder)?,
                })
            }
        }
    }
}

#[async_trait]
impl<C: CallProvider + 'static> FetchProvider<HeldAsset, BalanceRecord> for BalanceProvider<C> {
    async fn fetch(&self, missing: &[HeldAsset], timestamp: UnixTime) -> Result<Vec<BalanceRecord>> {
        let block_number = self
            .block_numbers
            .get_block_number_when_ready(timestamp)
            .await?;

        let requests = missing
            .iter()
            .map(|held| self.encode_request(held, block_number))
            .collect::<Result<Vec<_>>>()?;
        let responses = self.multicall.multicall(requests, block_number).await?;

        missing
            .iter()
            .zip(responses)
            .map(|(held, response)| {
                anyhow::ensure!(
                    response.success,
                    "balance call failed for holder {:?} asset {} at block {}",
                    held.holder,
                    held.token.asset_id,
                    block_number
                );
                let balance = decode_uint(&response.data).with_context(|| {
                    format!("undecodable balance for asset {}", held.token.asset_id)
                })?;
                Ok(BalanceRecord {
                    chain_id: self.chain_id,
                    timestamp,
                    holder: held.holder,
                    asset_id: held.token.asset_id.clone(),
                    balance,
                })
            })
            .collect()
    }
}

#[allow(deprecated)]
fn balance_of_function() -> Function {
    // function balanceOf(address owner) returns (uint256)
    Function {
        name: "balanceOf".to_string(),
        inputs: vec![Param {
            name: "owner".to_string(),
            kind: ParamType::Address,
            internal_type: None,
        }],
        outputs: vec![Param {
            name: "balance".to_string(),
            kind: ParamType::Uint(256),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::View,
    }
}

#[allow(deprecated)]
fn get_eth_balance_function() -> Function {
    // function getEthBalance(address addr) returns (uint256)
    Function {
        name: "getEthBalance".to_string(),
        inputs: vec![Param {
            name: "addr".to_string(),
            kind: ParamType::Address,
            internal_type: None,
        }],
        outputs: vec![Param {
            name: "balance".to_string(),
            kind: ParamType::Uint(256),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::View,
    }
}

pub fn encode_balance_of(holder: Address) -> Result<Bytes> {
    let calldata = balance_of_function().encode_input(&[Token::Address(holder)])?;
    Ok(Bytes::from(calldata))
}

pub fn encode_get_eth_balance(holder: Address) -> Result<Bytes> {
    let calldata = get_eth_balance_function().encode_input(&[Token::Address(holder)])?;
    Ok(Bytes::from(calldata))
}

/// Decodes a single `uint256` return value.
pub fn decode_uint(data: &Bytes) -> Result<U256> {
    let decoded = abi::decode(&[ParamType::Uint(256)], data)?;
    decoded
        .into_iter()
        .next()
        .and_then(|t| t.into_uint())
        .ok_or_else(|| anyhow::anyhow!("expected a uint256 return value"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicall::arbitrum_multicall_config;
    use crate::types::{AssetId, TrackedToken, ValueFormula};
    use std::sync::Mutex;

    struct ScriptedCallProvider {
        chain_id: ChainId,
        responses: Mutex<Vec<Result<Bytes>>>,
        calls: Mutex<Vec<(Address, Bytes, u64)>>,
    }

    #[async_trait]
    impl CallProvider for ScriptedCallProvider {
        fn chain_id(&self) -> ChainId {
            self.chain_id
        }

        async fn call(&self, to: Address, data: Bytes, block_number: u64) -> Result<Bytes> {
            self.calls.lock().unwrap().push((to, data, block_number));
            let mut responses = self.responses.lock().unwrap();
            anyhow::ensure!(!responses.is_empty(), "unexpected call");
            responses.remove(0)
        }
    }

    struct FixedHeight(u64);

    #[async_trait]
    impl BlockNumberSource for FixedHeight {
        async fn get_block_number_when_ready(&self, _timestamp: UnixTime) -> Result<u64> {
            Ok(self.0)
        }
    }

    fn held(id: &str, token_address: Option<Address>) -> HeldAsset {
        HeldAsset {
            holder: Address::repeat_byte(0x99),
            token: TrackedToken {
                asset_id: AssetId::new(id),
                address: token_address,
                decimals: 18,
                since_timestamp: UnixTime(0),
                formula: ValueFormula::Locked,
            },
            since_timestamp: UnixTime(0),
        }
    }

    fn encode_v2_uints(values: &[(bool, u64)]) -> Bytes {
        let tokens = Token::Array(
            values
                .iter()
                .map(|(ok, v)| {
                    let data = if *ok {
                        abi::encode(&[Token::Uint((*v).into())])
                    } else {
                        Vec::new()
                    };
                    Token::Tuple(vec![Token::Bool(*ok), Token::Bytes(data)])
                })
                .collect(),
        );
        Bytes::from(abi::encode(&[tokens]))
    }

    fn provider_with(
        responses: Vec<Result<Bytes>>,
    ) -> (Arc<ScriptedCallProvider>, BalanceProvider<ScriptedCallProvider>) {
        let rpc = Arc::new(ScriptedCallProvider {
            chain_id: ChainId::ARBITRUM,
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        });
        let multicall = Arc::new(
            MulticallClient::new(Arc::clone(&rpc), ChainId::ARBITRUM, arbitrum_multicall_config())
                .unwrap(),
        );
        let provider = BalanceProvider::new(multicall, Arc::new(FixedHeight(2_000_000)));
        (rpc, provider)
    }

    #[tokio::test]
    async fn test_fetch_mixes_erc20_and_native_lookups() {
        let response = encode_v2_uints(&[(true, 500), (true, 777)]);
        let (rpc, provider) = provider_with(vec![Ok(response)]);

        let token_address = Address::repeat_byte(0x42);
        let missing = vec![held("dai", Some(token_address)), held("ethereum", None)];
        let records = provider.fetch(&missing, UnixTime(3_600)).await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].balance, U256::from(500u64));
        assert_eq!(records[0].asset_id, AssetId::new("dai"));
        assert_eq!(records[1].balance, U256::from(777u64));

        // One aggregated round trip at the reconciled height.
        let calls = rpc.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, 2_000_000);
    }

    #[tokio::test]
    async fn test_failed_call_fails_the_whole_fetch() {
        let response = encode_v2_uints(&[(true, 500), (false, 0)]);
        let (_rpc, provider) = provider_with(vec![Ok(response)]);

        let missing = vec![
            held("dai", Some(Address::repeat_byte(0x42))),
            held("usd-coin", Some(Address::repeat_byte(0x43))),
        ];
        let err = provider.fetch(&missing, UnixTime(3_600)).await.unwrap_err();
        assert!(err.to_string().contains("usd-coin"));
    }

    #[test]
    fn test_balance_of_selector() {
        let data = encode_balance_of(Address::repeat_byte(0x11)).unwrap();
        // Canonical ERC-20 balanceOf(address) selector.
        assert_eq!(&data[..4], [0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(data.len(), 4 + 32);
    }

    #[test]
    fn test_uint_decode_round_trip() {
        let raw = Bytes::from(abi::encode(&[Token::Uint(42u64.into())]));
        assert_eq!(decode_uint(&raw).unwrap(), U256::from(42u64));
        assert!(decode_uint(&Bytes::default()).is_err());
    }
}
