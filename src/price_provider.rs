// Hourly USD prices from the CoinGecko market-chart API. Prices are
// chain-agnostic, so one price reconciler (under the offchain pseudo-chain)
// serves every chain submodule.

use crate::metrics;
use crate::reconciler::{FetchProvider, Reconciler};
use crate::stores::RecordStore;
use crate::types::{PriceRecord, TrackedToken, UnixTime};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use log::debug;
use serde::Deserialize;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const LOOKUP_CONCURRENCY: usize = 4;

/// Widest acceptable gap between the requested hour and the closest sample
/// the API returns. Beyond this the price is stale enough to be wrong data.
const MAX_SAMPLE_DISTANCE_SECS: f64 = 3_600.0;

/// Read side the report builder consumes: all reconciled prices for an hour.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn get_prices_when_ready(&self, timestamp: UnixTime) -> Result<Vec<PriceRecord>>;
}

#[async_trait]
impl<P, S> PriceSource for Reconciler<TrackedToken, PriceRecord, P, S>
where
    P: FetchProvider<TrackedToken, PriceRecord> + 'static,
    S: RecordStore<PriceRecord> + 'static,
{
    async fn get_prices_when_ready(&self, timestamp: UnixTime) -> Result<Vec<PriceRecord>> {
        self.get_data_when_ready(timestamp).await
    }
}

#[derive(Debug, Deserialize)]
struct MarketChart {
    prices: Vec<(f64, f64)>,
}

pub struct CoinGeckoPriceProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl CoinGeckoPriceProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }

    /// USD price for one asset at the full hour, taken from the sample
    /// closest to the hour within the range query around it.
    async fn query_price(&self, token: &TrackedToken, timestamp: UnixTime) -> Result<f64> {
        metrics::increment_rpc_call("coingecko");
        let mut url = format!(
            "{}/coins/{}/market_chart/range?vs_currency=usd&from={}&to={}",
            self.base_url,
            token.asset_id,
            timestamp.add_hours(-1).as_secs(),
            timestamp.add_hours(1).as_secs(),
        );
        if let Some(key) = &self.api_key {
            url.push_str(&format!("&x_cg_pro_api_key={}", key));
        }

        let response = self.client.get(&url).send().await?;
        anyhow::ensure!(
            response.status().is_success(),
            "price API returned HTTP {} for {}",
            response.status(),
            token.asset_id
        );
        let chart: MarketChart = response
            .json()
            .await
            .with_context(|| format!("unparseable price response for {}", token.asset_id))?;

        let price = closest_price(&chart.prices, timestamp).ok_or_else(|| {
            anyhow::anyhow!(
                "no price sample within an hour of {} for {}",
                timestamp,
                token.asset_id
            )
        })?;
        debug!("Price for {} at {}: {} USD", token.asset_id, timestamp, price);
        Ok(price)
    }
}

#[async_trait]
impl FetchProvider<TrackedToken, PriceRecord> for CoinGeckoPriceProvider {
    async fn fetch(
        &self,
        missing: &[TrackedToken],
        timestamp: UnixTime,
    ) -> Result<Vec<PriceRecord>> {
        stream::iter(missing.to_vec())
            .map(|token| async move {
                let price_usd = self.query_price(&token, timestamp).await?;
                Ok::<_, anyhow::Error>(PriceRecord {
                    timestamp,
                    asset_id: token.asset_id,
                    price_usd,
                })
            })
            .buffered(LOOKUP_CONCURRENCY)
            .try_collect()
            .await
    }
}

/// Sample closest to the hour, in milliseconds as the API reports them.
/// Returns `None` when every sample is more than an hour away.
fn closest_price(samples: &[(f64, f64)], timestamp: UnixTime) -> Option<f64> {
    let target_ms = timestamp.as_secs() as f64 * 1_000.0;
    samples
        .iter()
        .map(|(ms, price)| ((ms - target_ms).abs(), *price))
        .filter(|(distance, _)| *distance <= MAX_SAMPLE_DISTANCE_SECS * 1_000.0)
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, price)| price)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closest_price_picks_nearest_sample() {
        let ts = UnixTime(1_000 * HOUR_SECS);
        let samples = vec![
            ((ts.as_secs() - 600) as f64 * 1_000.0, 1.0),
            ((ts.as_secs() - 60) as f64 * 1_000.0, 2.0),
            ((ts.as_secs() + 300) as f64 * 1_000.0, 3.0),
        ];
        assert_eq!(closest_price(&samples, ts), Some(2.0));
    }

    const HOUR_SECS: i64 = 3_600;

    #[test]
    fn test_closest_price_rejects_stale_samples() {
        let ts = UnixTime(1_000 * HOUR_SECS);
        let samples = vec![((ts.as_secs() - 2 * HOUR_SECS) as f64 * 1_000.0, 1.0)];
        assert_eq!(closest_price(&samples, ts), None);
        assert_eq!(closest_price(&[], ts), None);
    }

    #[test]
    fn test_market_chart_parsing() {
        let chart: MarketChart = serde_json::from_str(
            r#"{"prices":[[1619000000000,2345.1],[1619003600000,2350.7]],"market_caps":[],"total_volumes":[]}"#,
        )
        .unwrap();
        assert_eq!(chart.prices.len(), 2);
        assert_eq!(chart.prices[1].1, 2350.7);
    }
}
