//! # Pipeline Orchestrator
//!
//! Wires the per-chain submodules and the shared price reconciler to one
//! hourly clock and starts them.
//!
//! ## Overview
//!
//! The orchestrator:
//! - Builds one price reconciler over the union of priced assets (prices are
//!   chain-agnostic, so it runs once under the offchain pseudo-chain)
//! - Builds one submodule per enabled chain: block numbers first, then
//!   balances and total supplies on top of them, then derived reports
//! - Subscribes everything to a shared hourly clock replaying from the
//!   configured minimum timestamp
//!
//! ## Usage
//!
//! ```rust,no_run
//! # async fn run() -> anyhow::Result<()> {
//! use tvl_pipeline_sdk::orchestrator::Orchestrator;
//! use tvl_pipeline_sdk::settings::Settings;
//!
//! let settings = Settings::new()?;
//! let db_pool = tvl_pipeline_sdk::database::connect(&settings.database.url).await?;
//! let orchestrator = Orchestrator::new(settings, db_pool)?;
//! let _handles = orchestrator.start().await?;
//! # Ok(())
//! # }
//! ```

use crate::balance_provider::BalanceProvider;
use crate::block_number_provider::{BlockNumberSource, EtherscanBlockProvider};
use crate::clock::{Clock, ClockHandle, HourlyClock};
use crate::database::{
    DbPool, PostgresBalanceStore, PostgresBlockNumberStore, PostgresCompletionStore,
    PostgresPriceStore, PostgresReportStore, PostgresTotalSupplyStore,
};
use crate::ethereum_client::EthereumClient;
use crate::multicall::MulticallClient;
use crate::price_provider::{CoinGeckoPriceProvider, PriceSource};
use crate::reconciler::{BlockNumberEntity, Reconciler};
use crate::reports::{BalanceSource, ReportProvider, SupplySource};
use crate::settings::{ChainSettings, Settings};
use crate::types::{
    expand_escrows, BalanceRecord, BlockNumberRecord, ChainId, HeldAsset, PriceRecord,
    ReportRecord, TotalSupplyRecord, TrackedToken, UnixTime, ValueFormula,
};
use anyhow::Result;
use std::collections::BTreeMap;
use tracing::info;
use std::sync::Arc;

pub type BlockNumberReconciler =
    Reconciler<BlockNumberEntity, BlockNumberRecord, EtherscanBlockProvider, PostgresBlockNumberStore>;
pub type BalanceReconciler =
    Reconciler<HeldAsset, BalanceRecord, BalanceProvider<EthereumClient>, PostgresBalanceStore>;
pub type TotalSupplyReconciler = Reconciler<
    TrackedToken,
    TotalSupplyRecord,
    TotalSupplyProviderAlias,
    PostgresTotalSupplyStore,
>;
type TotalSupplyProviderAlias = crate::total_supply_provider::TotalSupplyProvider<EthereumClient>;
pub type PriceReconciler =
    Reconciler<TrackedToken, PriceRecord, CoinGeckoPriceProvider, PostgresPriceStore>;
pub type ReportReconciler =
    Reconciler<TrackedToken, ReportRecord, ReportProvider, PostgresReportStore>;

/// All reconcilers of one chain, wired but not yet started.
pub struct ChainSubmodule {
    chain_id: ChainId,
    block_numbers: Arc<BlockNumberReconciler>,
    balances: Option<Arc<BalanceReconciler>>,
    supplies: Option<Arc<TotalSupplyReconciler>>,
    reports: Arc<ReportReconciler>,
}

impl ChainSubmodule {
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Starts every reconciler of the submodule. Order does not matter for
    /// correctness, the derived reconcilers wait on their upstreams anyway.
    pub async fn start(&self) -> Result<Vec<ClockHandle>> {
        let mut handles = Vec::new();
        handles.push(self.block_numbers.start().await?);
        if let Some(balances) = &self.balances {
            handles.push(balances.start().await?);
        }
        if let Some(supplies) = &self.supplies {
            handles.push(supplies.start().await?);
        }
        handles.push(self.reports.start().await?);
        info!("🚀 [{}] Chain submodule started", self.chain_id);
        Ok(handles)
    }
}

pub struct Orchestrator {
    settings: Settings,
    db_pool: DbPool,
    clock: Arc<dyn Clock>,
    prices: Arc<PriceReconciler>,
}

impl Orchestrator {
    pub fn new(settings: Settings, db_pool: DbPool) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(HourlyClock::new(settings.min_timestamp()));
        let prices = Self::build_price_reconciler(&settings, &db_pool, Arc::clone(&clock))?;
        Ok(Self {
            settings,
            db_pool,
            clock,
            prices,
        })
    }

    /// Starts the price reconciler and one submodule per enabled chain. The
    /// returned handles keep the clock subscriptions alive.
    pub async fn start(&self) -> Result<Vec<ClockHandle>> {
        let mut handles = Vec::new();
        handles.push(self.prices.start().await?);
        for chain in self.settings.chains.clone() {
            if let Some(submodule) = self.chain_submodule(&chain)? {
                handles.extend(submodule.start().await?);
            }
        }
        Ok(handles)
    }

    /// Builds the submodule for one chain, or `None` when the chain is
    /// disabled in configuration.
    pub fn chain_submodule(&self, chain: &ChainSettings) -> Result<Option<ChainSubmodule>> {
        let chain_id = chain.chain_id();
        if !chain.enabled {
            info!("[{}] Chain disabled, skipping submodule", chain_id);
            return Ok(None);
        }

        let rpc = Arc::new(EthereumClient::new(&chain.rpc_url, chain_id)?);
        let multicall = Arc::new(MulticallClient::new(
            Arc::clone(&rpc),
            chain_id,
            chain.multicall_entries(),
        )?);
        let completion_store = PostgresCompletionStore::new(self.db_pool.clone());

        let block_provider = Arc::new(EtherscanBlockProvider::new(
            chain_id,
            chain.explorer_url.clone(),
            chain.explorer_api_key.clone(),
        )?);
        let block_numbers: Arc<BlockNumberReconciler> = Arc::new(Reconciler::new(
            "block_number",
            chain_id,
            vec![BlockNumberEntity {
                chain_id,
                since_timestamp: self.settings.min_timestamp(),
            }],
            block_provider,
            PostgresBlockNumberStore::new(self.db_pool.clone()),
            completion_store.clone(),
            Arc::clone(&self.clock),
        )?);
        let block_source: Arc<dyn BlockNumberSource> = block_numbers.clone();

        let held = expand_escrows(&chain.escrows);
        let balances: Option<Arc<BalanceReconciler>> = if held.is_empty() {
            None
        } else {
            Some(Arc::new(Reconciler::new(
                "balance",
                chain_id,
                held,
                Arc::new(BalanceProvider::new(
                    Arc::clone(&multicall),
                    Arc::clone(&block_source),
                )),
                PostgresBalanceStore::new(self.db_pool.clone()),
                completion_store.clone(),
                Arc::clone(&self.clock),
            )?))
        };

        let supply_tokens: Vec<TrackedToken> = chain
            .tokens
            .iter()
            .filter(|t| t.formula == ValueFormula::TotalSupply)
            .cloned()
            .collect();
        let supplies: Option<Arc<TotalSupplyReconciler>> = if supply_tokens.is_empty() {
            None
        } else {
            Some(Arc::new(Reconciler::new(
                "total_supply",
                chain_id,
                supply_tokens,
                Arc::new(crate::total_supply_provider::TotalSupplyProvider::new(
                    Arc::clone(&multicall),
                    Arc::clone(&block_source),
                )),
                PostgresTotalSupplyStore::new(self.db_pool.clone()),
                completion_store.clone(),
                Arc::clone(&self.clock),
            )?))
        };

        let report_provider = ReportProvider::new(
            chain_id,
            self.prices.clone() as Arc<dyn PriceSource>,
            balances
                .clone()
                .map(|r| r as Arc<dyn BalanceSource>),
            supplies
                .clone()
                .map(|r| r as Arc<dyn SupplySource>),
        );
        let reports: Arc<ReportReconciler> = Arc::new(Reconciler::new(
            "report",
            chain_id,
            report_tokens(chain),
            Arc::new(report_provider),
            PostgresReportStore::new(self.db_pool.clone()),
            completion_store,
            Arc::clone(&self.clock),
        )?);

        Ok(Some(ChainSubmodule {
            chain_id,
            block_numbers,
            balances,
            supplies,
            reports,
        }))
    }

    fn build_price_reconciler(
        settings: &Settings,
        db_pool: &DbPool,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<PriceReconciler>> {
        let provider = Arc::new(CoinGeckoPriceProvider::new(
            settings.prices.base_url.clone(),
            settings.prices.api_key.clone(),
        )?);
        Ok(Arc::new(Reconciler::new(
            "price",
            ChainId::OFFCHAIN,
            priced_assets(settings),
            provider,
            PostgresPriceStore::new(db_pool.clone()),
            PostgresCompletionStore::new(db_pool.clone()),
            clock,
        )?))
    }
}

/// The tokens a chain reports on: every total-supply token plus every token
/// held by an escrow, de-duplicated per asset with the earliest activation.
pub fn report_tokens(chain: &ChainSettings) -> Vec<TrackedToken> {
    let mut by_asset: BTreeMap<String, TrackedToken> = BTreeMap::new();
    let mut insert = |token: TrackedToken, since: UnixTime| {
        by_asset
            .entry(token.asset_id.0.clone())
            .and_modify(|existing| {
                if since < existing.since_timestamp {
                    existing.since_timestamp = since;
                }
            })
            .or_insert_with(|| TrackedToken {
                since_timestamp: since,
                ..token
            });
    };
    for token in chain
        .tokens
        .iter()
        .filter(|t| t.formula == ValueFormula::TotalSupply)
    {
        insert(token.clone(), token.since_timestamp);
    }
    for held in expand_escrows(&chain.escrows) {
        let since = held.since_timestamp;
        insert(held.token, since);
    }
    by_asset.into_values().collect()
}

/// Union of all assets that need a USD price, across every enabled chain.
/// Ordered by asset id so the config fingerprint is stable under chain
/// reordering.
pub fn priced_assets(settings: &Settings) -> Vec<TrackedToken> {
    let mut by_asset: BTreeMap<String, TrackedToken> = BTreeMap::new();
    for chain in settings.chains.iter().filter(|c| c.enabled) {
        for token in report_tokens(chain) {
            by_asset
                .entry(token.asset_id.0.clone())
                .and_modify(|existing| {
                    if token.since_timestamp < existing.since_timestamp {
                        existing.since_timestamp = token.since_timestamp;
                    }
                })
                .or_insert(token);
        }
    }
    by_asset.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetId, EscrowConfig};
    use ethers::types::Address;

    fn token(id: &str, since: i64, formula: ValueFormula) -> TrackedToken {
        TrackedToken {
            asset_id: AssetId::new(id),
            address: Some(Address::repeat_byte(0x42)),
            decimals: 18,
            since_timestamp: UnixTime(since),
            formula,
        }
    }

    fn chain_with(tokens: Vec<TrackedToken>, escrows: Vec<EscrowConfig>) -> ChainSettings {
        let toml = r#"
            chain_id = 1
            rpc_url = "http://localhost:8545"
            explorer_url = "https://api.etherscan.io/api"
        "#;
        let mut chain: ChainSettings = toml::from_str(toml).unwrap();
        chain.tokens = tokens;
        chain.escrows = escrows;
        chain
    }

    #[test]
    fn test_report_tokens_deduplicates_with_earliest_activation() {
        let escrow = EscrowConfig {
            address: Address::repeat_byte(0x01),
            since_timestamp: UnixTime(7_200),
            tokens: vec![token("dai", 0, ValueFormula::Locked)],
        };
        let chain = chain_with(
            vec![
                token("arbitrum", 3_600, ValueFormula::TotalSupply),
                // Locked tokens outside escrows produce no report entry on
                // their own.
                token("dai", 0, ValueFormula::Locked),
            ],
            vec![escrow],
        );

        let tokens = report_tokens(&chain);
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].asset_id, AssetId::new("arbitrum"));
        let dai = &tokens[1];
        assert_eq!(dai.asset_id, AssetId::new("dai"));
        // Escrow activates at 7200 even though the token says 0.
        assert_eq!(dai.since_timestamp, UnixTime(7_200));
    }

    #[test]
    fn test_priced_assets_union_across_chains() {
        let mut chain_a = chain_with(vec![token("dai", 7_200, ValueFormula::TotalSupply)], vec![]);
        chain_a.chain_id = 1;
        let mut chain_b = chain_with(vec![token("dai", 3_600, ValueFormula::TotalSupply)], vec![]);
        chain_b.chain_id = 42161;
        let mut disabled = chain_with(vec![token("frax", 0, ValueFormula::TotalSupply)], vec![]);
        disabled.enabled = false;

        let settings: Settings = Settings {
            min_timestamp: 0,
            chains: vec![chain_a, chain_b, disabled],
            database: crate::settings::DatabaseSettings {
                url: "postgres://localhost/test".to_string(),
            },
            prices: Default::default(),
            log: Default::default(),
            metrics: Default::default(),
        };

        let assets = priced_assets(&settings);
        assert_eq!(assets.len(), 1);
        // Earliest activation across chains wins.
        assert_eq!(assets[0].since_timestamp, UnixTime(3_600));
    }
}
