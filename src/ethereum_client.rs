// Thin read-only RPC surface the batch client is built on: a single
// `eth_call` at a historical block. Kept as a trait so the multicall client
// and providers can run against a mock transport in tests.

use crate::metrics;
use crate::types::ChainId;
use anyhow::Result;
use async_trait::async_trait;
use ethers::prelude::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockId, Bytes, TransactionRequest};
use std::sync::Arc;

#[async_trait]
pub trait CallProvider: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// Read-only `eth_call` against a historical block. A transport error is
    /// an error here; a reverted call surfaces as empty return data on most
    /// providers and is interpreted by the caller.
    async fn call(&self, to: Address, data: Bytes, block_number: u64) -> Result<Bytes>;
}

/// JSON-RPC backed implementation over `ethers` `Provider<Http>`.
pub struct EthereumClient {
    provider: Arc<Provider<Http>>,
    chain_id: ChainId,
}

impl EthereumClient {
    pub fn new(rpc_url: &str, chain_id: ChainId) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)?;
        Ok(Self {
            provider: Arc::new(provider),
            chain_id,
        })
    }

    pub fn from_provider(provider: Arc<Provider<Http>>, chain_id: ChainId) -> Self {
        Self { provider, chain_id }
    }

    /// Verifies the configured chain id against the node. Wiring a client to
    /// the wrong endpoint is a construction-time error, not something to
    /// discover mid-reconciliation.
    pub async fn assert_chain_id(&self) -> Result<()> {
        let reported = self.provider.get_chainid().await?.as_u64();
        anyhow::ensure!(
            reported == self.chain_id.as_u64(),
            "RPC endpoint reports chain id {} but client is configured for {} ({})",
            reported,
            self.chain_id.as_u64(),
            self.chain_id
        );
        Ok(())
    }
}

#[async_trait]
impl CallProvider for EthereumClient {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn call(&self, to: Address, data: Bytes, block_number: u64) -> Result<Bytes> {
        metrics::increment_rpc_call("ethereum_client");
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        let result = self
            .provider
            .call(&tx, Some(BlockId::from(block_number)))
            .await?;
        Ok(result)
    }
}
