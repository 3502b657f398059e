// Derived per-asset value reports: raw amounts from the chain reconcilers
// joined with USD prices. A report provider never talks to the chain itself;
// it waits on the upstream reconcilers and persists a pure join.

use crate::price_provider::PriceSource;
use crate::reconciler::{FetchProvider, Reconciler};
use crate::stores::RecordStore;
use crate::types::{
    AssetId, BalanceRecord, ChainId, HeldAsset, ReportRecord, TotalSupplyRecord, TrackedToken,
    UnixTime, ValueFormula,
};
use anyhow::Result;
use async_trait::async_trait;
use ethers::types::U256;
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

/// Read side over the balance reconciler.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn get_balances_when_ready(&self, timestamp: UnixTime) -> Result<Vec<BalanceRecord>>;
}

#[async_trait]
impl<P, S> BalanceSource for Reconciler<HeldAsset, BalanceRecord, P, S>
where
    P: FetchProvider<HeldAsset, BalanceRecord> + 'static,
    S: RecordStore<BalanceRecord> + 'static,
{
    async fn get_balances_when_ready(&self, timestamp: UnixTime) -> Result<Vec<BalanceRecord>> {
        self.get_data_when_ready(timestamp).await
    }
}

/// Read side over the total-supply reconciler.
#[async_trait]
pub trait SupplySource: Send + Sync {
    async fn get_supplies_when_ready(&self, timestamp: UnixTime)
        -> Result<Vec<TotalSupplyRecord>>;
}

#[async_trait]
impl<P, S> SupplySource for Reconciler<TrackedToken, TotalSupplyRecord, P, S>
where
    P: FetchProvider<TrackedToken, TotalSupplyRecord> + 'static,
    S: RecordStore<TotalSupplyRecord> + 'static,
{
    async fn get_supplies_when_ready(
        &self,
        timestamp: UnixTime,
    ) -> Result<Vec<TotalSupplyRecord>> {
        self.get_data_when_ready(timestamp).await
    }
}

pub struct ReportProvider {
    chain_id: ChainId,
    prices: Arc<dyn PriceSource>,
    balances: Option<Arc<dyn BalanceSource>>,
    supplies: Option<Arc<dyn SupplySource>>,
}

impl ReportProvider {
    pub fn new(
        chain_id: ChainId,
        prices: Arc<dyn PriceSource>,
        balances: Option<Arc<dyn BalanceSource>>,
        supplies: Option<Arc<dyn SupplySource>>,
    ) -> Self {
        Self {
            chain_id,
            prices,
            balances,
            supplies,
        }
    }

    async fn locked_amounts(&self, timestamp: UnixTime) -> Result<HashMap<AssetId, U256>> {
        let source = self
            .balances
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("locked-value assets configured without escrows"))?;
        let mut amounts: HashMap<AssetId, U256> = HashMap::new();
        for record in source.get_balances_when_ready(timestamp).await? {
            let slot = amounts.entry(record.asset_id).or_insert_with(U256::zero);
            *slot = slot.saturating_add(record.balance);
        }
        Ok(amounts)
    }

    async fn supply_amounts(&self, timestamp: UnixTime) -> Result<HashMap<AssetId, U256>> {
        let source = self.supplies.as_ref().ok_or_else(|| {
            anyhow::anyhow!("total-supply assets configured without a supply reconciler")
        })?;
        Ok(source
            .get_supplies_when_ready(timestamp)
            .await?
            .into_iter()
            .map(|r| (r.asset_id, r.total_supply))
            .collect())
    }
}

#[async_trait]
impl FetchProvider<TrackedToken, ReportRecord> for ReportProvider {
    async fn fetch(
        &self,
        missing: &[TrackedToken],
        timestamp: UnixTime,
    ) -> Result<Vec<ReportRecord>> {
        let prices: HashMap<AssetId, f64> = self
            .prices
            .get_prices_when_ready(timestamp)
            .await?
            .into_iter()
            .map(|p| (p.asset_id, p.price_usd))
            .collect();

        let needs_balances = missing.iter().any(|t| t.formula == ValueFormula::Locked);
        let needs_supplies = missing
            .iter()
            .any(|t| t.formula == ValueFormula::TotalSupply);
        let locked = if needs_balances {
            self.locked_amounts(timestamp).await?
        } else {
            HashMap::new()
        };
        let supplies = if needs_supplies {
            self.supply_amounts(timestamp).await?
        } else {
            HashMap::new()
        };

        let mut reports = Vec::with_capacity(missing.len());
        for token in missing {
            let price_usd = match prices.get(&token.asset_id) {
                Some(price) => *price,
                None => {
                    // An unpriced asset must not block the rest of the hour's
                    // report; it is left out of this hour's rows.
                    warn!(
                        "[report:{}] No price for {} at {}, skipping",
                        self.chain_id, token.asset_id, timestamp
                    );
                    continue;
                }
            };
            let amounts = match token.formula {
                ValueFormula::Locked => &locked,
                ValueFormula::TotalSupply => &supplies,
            };
            let amount = match amounts.get(&token.asset_id).copied() {
                Some(amount) => amount,
                None => {
                    warn!(
                        "[report:{}] No reconciled amount for {} at {}, skipping",
                        self.chain_id, token.asset_id, timestamp
                    );
                    continue;
                }
            };
            reports.push(ReportRecord {
                chain_id: self.chain_id,
                timestamp,
                asset_id: token.asset_id.clone(),
                amount,
                usd_value: usd_value(amount, token.decimals, price_usd),
            });
        }
        Ok(reports)
    }
}

/// `amount` scaled down by the token's decimals, in USD. Lossy by design:
/// reports are a human-facing aggregate, the exact raw amount travels in the
/// record alongside it.
pub fn usd_value(amount: U256, decimals: u8, price_usd: f64) -> f64 {
    u256_to_f64(amount) / 10f64.powi(decimals as i32) * price_usd
}

fn u256_to_f64(value: U256) -> f64 {
    value
        .0
        .iter()
        .enumerate()
        .map(|(i, limb)| *limb as f64 * 2f64.powi(64 * i as i32))
        .sum()
}
