// Core types shared across the pipeline: chain identifiers, hourly timestamps,
// asset identifiers and the per-kind timestamped records.

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric chain identifier (EIP-155).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId(pub u64);

impl ChainId {
    pub const ETHEREUM: ChainId = ChainId(1);
    pub const ARBITRUM: ChainId = ChainId(42161);
    /// Pseudo-chain for data that is not tied to any chain (e.g. USD prices).
    pub const OFFCHAIN: ChainId = ChainId(0);

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "offchain",
            1 => "ethereum",
            42161 => "arbitrum",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Unix timestamp in seconds. The pipeline only ever works with full-hour
/// boundaries; `to_start_of_hour` is applied at every entry point.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct UnixTime(pub i64);

pub const HOUR: i64 = 3_600;

impl UnixTime {
    pub fn from_secs(secs: i64) -> Self {
        UnixTime(secs)
    }

    pub fn now() -> Self {
        UnixTime(chrono::Utc::now().timestamp())
    }

    pub fn as_secs(&self) -> i64 {
        self.0
    }

    pub fn to_start_of_hour(&self) -> Self {
        UnixTime(self.0 - self.0.rem_euclid(HOUR))
    }

    pub fn is_full_hour(&self) -> bool {
        self.0.rem_euclid(HOUR) == 0
    }

    pub fn add_hours(&self, hours: i64) -> Self {
        UnixTime(self.0 + hours * HOUR)
    }

    pub fn gt(&self, other: &UnixTime) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for a tracked asset (e.g. `"arbitrum"`, `"usd-coin"`).
/// Doubles as the CoinGecko id for priced assets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        AssetId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a token's locked value is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueFormula {
    /// Value = circulating `totalSupply()` of the token contract.
    TotalSupply,
    /// Value = sum of balances held by configured escrow addresses.
    Locked,
}

/// A token the pipeline is configured to track on some chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedToken {
    pub asset_id: AssetId,
    /// `None` for the chain's native asset.
    pub address: Option<Address>,
    pub decimals: u8,
    /// Timestamps strictly before this are excluded from reconciliation.
    pub since_timestamp: UnixTime,
    pub formula: ValueFormula,
}

/// An escrow contract holding tracked tokens on behalf of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowConfig {
    pub address: Address,
    pub since_timestamp: UnixTime,
    pub tokens: Vec<TrackedToken>,
}

/// A single (holder, asset) pair the balance reconciler must resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldAsset {
    pub holder: Address,
    pub token: TrackedToken,
    /// max(escrow.since_timestamp, token.since_timestamp)
    pub since_timestamp: UnixTime,
}

/// One fetched balance data point, keyed by (chain, timestamp, holder, asset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceRecord {
    pub chain_id: ChainId,
    pub timestamp: UnixTime,
    pub holder: Address,
    pub asset_id: AssetId,
    pub balance: U256,
}

/// One fetched total supply data point, keyed by (chain, timestamp, asset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotalSupplyRecord {
    pub chain_id: ChainId,
    pub timestamp: UnixTime,
    pub asset_id: AssetId,
    pub total_supply: U256,
}

/// One USD price data point, keyed by (timestamp, asset). Prices are
/// chain-agnostic; the reconciler that owns them runs under `ChainId::OFFCHAIN`.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRecord {
    pub timestamp: UnixTime,
    pub asset_id: AssetId,
    pub price_usd: f64,
}

/// The canonical block height for a given hourly timestamp on a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockNumberRecord {
    pub chain_id: ChainId,
    pub timestamp: UnixTime,
    pub block_number: u64,
}

/// Derived per-asset value report, keyed by (chain, timestamp, asset).
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRecord {
    pub chain_id: ChainId,
    pub timestamp: UnixTime,
    pub asset_id: AssetId,
    /// Raw token amount (supply or aggregated balance) in the token's decimals.
    pub amount: U256,
    pub usd_value: f64,
}

/// Expands escrow configuration into the flat (holder, asset) pairs the
/// balance reconciler tracks. Activation is the later of the escrow's and the
/// token's own since-timestamp.
pub fn expand_escrows(escrows: &[EscrowConfig]) -> Vec<HeldAsset> {
    let mut held = Vec::new();
    for escrow in escrows {
        for token in &escrow.tokens {
            let since = if token.since_timestamp.gt(&escrow.since_timestamp) {
                token.since_timestamp
            } else {
                escrow.since_timestamp
            };
            held.push(HeldAsset {
                holder: escrow.address,
                token: token.clone(),
                since_timestamp: since,
            });
        }
    }
    held
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_start_of_hour() {
        assert_eq!(UnixTime(7_201).to_start_of_hour(), UnixTime(7_200));
        assert_eq!(UnixTime(7_200).to_start_of_hour(), UnixTime(7_200));
        assert!(UnixTime(7_200).is_full_hour());
        assert!(!UnixTime(7_201).is_full_hour());
    }

    #[test]
    fn test_add_hours() {
        assert_eq!(UnixTime(0).add_hours(2), UnixTime(7_200));
        assert_eq!(UnixTime(7_200).add_hours(-1), UnixTime(3_600));
    }

    #[test]
    fn test_expand_escrows_uses_later_activation() {
        let token = TrackedToken {
            asset_id: AssetId::new("usd-coin"),
            address: Some(Address::repeat_byte(0x11)),
            decimals: 6,
            since_timestamp: UnixTime(100),
            formula: ValueFormula::Locked,
        };
        let escrow = EscrowConfig {
            address: Address::repeat_byte(0x22),
            since_timestamp: UnixTime(500),
            tokens: vec![token],
        };
        let held = expand_escrows(&[escrow]);
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].since_timestamp, UnixTime(500));
    }
}
