//! # TVL Pipeline SDK
//!
//! A Rust library for time-indexed, configuration-versioned reconciliation of
//! on-chain value metrics: token balances, total supplies, USD prices and
//! derived per-asset value reports.
//!
//! ## Overview
//!
//! The pipeline keeps an hourly time series complete and consistent:
//!
//! - **Clock**: replays every full hour from a configured minimum timestamp,
//!   then fires on each hour boundary
//! - **Reconcilers**: one generic component instantiated per data kind,
//!   tracking which hours are resolved under the current configuration
//! - **Multicall**: batches hundreds of read-only calls per round trip,
//!   selecting the aggregation contract by block height
//! - **Completion tracking**: reconciled hours are keyed by a fingerprint of
//!   the tracked-entity set, so configuration changes trigger a clean backfill
//!
//! ## Architecture
//!
//! ### Data Layer
//! Fetch providers resolve entities at a timestamp: block heights from an
//! explorer API, balances and supplies over batched `eth_call`s, prices from
//! CoinGecko, reports as a pure join of the above.
//!
//! ### Reconciliation Layer
//! Each reconciler owns a sequential task queue fed by the shared clock.
//! Front insertion turns the oldest-first replay into newest-first backfill.
//!
//! ### Persistence Layer
//! PostgreSQL stores with insert-only semantics: reconciliation fills gaps in
//! history, it never rewrites it.

// Core Types
/// Chain ids, hourly timestamps, tracked tokens and record types
pub mod types;
/// Fingerprint of a reconciler's tracked-entity configuration
pub mod config_hash;

// Reconciliation Layer
/// Shared hourly clock with historical replay
pub mod clock;
/// Sequential task queue with front insertion for backfill
pub mod task_queue;
/// Generic timestamped reconciler
pub mod reconciler;
/// Persistence seams and in-memory implementations
pub mod stores;

// Data Layer
/// Read-only RPC surface over an `ethers` HTTP provider
pub mod ethereum_client;
/// Versioned batch call client (aggregate / tryAggregate)
pub mod multicall;
/// Timestamp-to-block-height resolution via explorer APIs
pub mod block_number_provider;
/// Escrow balance lookups (ERC-20 and native)
pub mod balance_provider;
/// Circulating supply lookups
pub mod total_supply_provider;
/// USD prices from CoinGecko
pub mod price_provider;
/// Derived per-asset value reports
pub mod reports;

// Infrastructure
/// PostgreSQL persistence
pub mod database;
/// Configuration loading (Config.toml + environment overrides)
pub mod settings;
/// Metrics and observability
pub mod metrics;
/// Wiring of chain submodules and the shared price reconciler
pub mod orchestrator;

pub use config_hash::{config_hash, ConfigHash};
pub use orchestrator::{ChainSubmodule, Orchestrator};
pub use reconciler::{FetchProvider, Reconciler, ReconcilerEntity, ReconcilerRecord};
pub use types::{AssetId, ChainId, TrackedToken, UnixTime};
