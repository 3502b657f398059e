use crate::multicall::{
    arbitrum_multicall_config, ethereum_multicall_config, MulticallConfigEntry,
};
use crate::types::{ChainId, EscrowConfig, TrackedToken, UnixTime};
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9100
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PriceApi {
    #[serde(default = "default_coingecko_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_coingecko_base_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}

impl Default for PriceApi {
    fn default() -> Self {
        Self {
            base_url: default_coingecko_base_url(),
            api_key: None,
        }
    }
}

/// Per-chain pipeline configuration: RPC endpoint, block explorer, the
/// tracked token set and the escrows holding locked value.
#[derive(Debug, Deserialize, Clone)]
pub struct ChainSettings {
    pub chain_id: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub rpc_url: String,
    pub explorer_url: String,
    #[serde(default)]
    pub explorer_api_key: String,
    /// Overrides the built-in aggregation contract table when set.
    #[serde(default)]
    pub multicall: Option<Vec<MulticallConfigEntry>>,
    #[serde(default)]
    pub tokens: Vec<TrackedToken>,
    #[serde(default)]
    pub escrows: Vec<EscrowConfig>,
}

fn default_true() -> bool {
    true
}

impl ChainSettings {
    pub fn chain_id(&self) -> ChainId {
        ChainId(self.chain_id)
    }

    /// Configured override, or the built-in deployment history for chains
    /// that have one. A chain with neither runs on individual calls only.
    pub fn multicall_entries(&self) -> Vec<MulticallConfigEntry> {
        if let Some(entries) = &self.multicall {
            return entries.clone();
        }
        match ChainId(self.chain_id) {
            ChainId::ETHEREUM => ethereum_multicall_config(),
            ChainId::ARBITRUM => arbitrum_multicall_config(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Oldest hour the pipeline backfills, as a unix timestamp. Rounded down
    /// to the hour boundary at load.
    pub min_timestamp: i64,
    pub chains: Vec<ChainSettings>,
    pub database: DatabaseSettings,
    #[serde(default)]
    pub prices: PriceApi,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub metrics: Metrics,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("Config.toml"))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Environment overrides for secrets that should stay out of the file.
        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                settings.database.url = url;
            }
        }
        if let Ok(key) = env::var("COINGECKO_API_KEY") {
            if !key.trim().is_empty() {
                settings.prices.api_key = Some(key);
            }
        }
        for chain in &mut settings.chains {
            let rpc_var = format!("TVL_RPC_URL_{}", chain.chain_id);
            if let Ok(url) = env::var(&rpc_var) {
                if !url.trim().is_empty() {
                    chain.rpc_url = url;
                }
            }
            let explorer_var = format!("TVL_EXPLORER_API_KEY_{}", chain.chain_id);
            if let Ok(key) = env::var(&explorer_var) {
                if !key.trim().is_empty() {
                    chain.explorer_api_key = key;
                }
            }
        }

        Ok(settings)
    }

    pub fn min_timestamp(&self) -> UnixTime {
        UnixTime::from_secs(self.min_timestamp).to_start_of_hour()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_settings_parse_with_defaults() {
        let toml = r#"
            chain_id = 1
            rpc_url = "http://localhost:8545"
            explorer_url = "https://api.etherscan.io/api"

            [[tokens]]
            asset_id = "dai"
            address = "0x6b175474e89094c44da98b954eedeac495271d0f"
            decimals = 18
            since_timestamp = 1546300800
            formula = "locked"
        "#;
        let chain: ChainSettings = toml::from_str(toml).unwrap();
        assert!(chain.enabled);
        assert_eq!(chain.chain_id(), ChainId::ETHEREUM);
        assert_eq!(chain.tokens.len(), 1);
        assert!(chain.escrows.is_empty());
        // Built-in table kicks in when no override is configured.
        assert_eq!(chain.multicall_entries().len(), 2);
    }

    #[test]
    fn test_unknown_chain_has_no_builtin_multicall() {
        let toml = r#"
            chain_id = 10
            rpc_url = "http://localhost:8545"
            explorer_url = "https://api-optimistic.etherscan.io/api"
        "#;
        let chain: ChainSettings = toml::from_str(toml).unwrap();
        assert!(chain.multicall_entries().is_empty());
    }
}
