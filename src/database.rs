// Postgres persistence for reconciled records and completion rows.
//
// Every insert is ON CONFLICT DO NOTHING: reconciliation fills gaps in
// history, it never rewrites it. Schema creation is guarded by an advisory
// lock so concurrently starting instances do not race the migration.

use crate::config_hash::ConfigHash;
use crate::stores::{CompletionStatus, CompletionStore, RecordStore};
use crate::types::{
    BalanceRecord, BlockNumberRecord, ChainId, PriceRecord, ReportRecord, TotalSupplyRecord,
    UnixTime,
};
use anyhow::Result;
use async_trait::async_trait;
use ethers::types::{Address, U256};
use sqlx::{postgres::PgPoolOptions, Connection, Pool, Postgres, Row};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub type DbPool = Pool<Postgres>;

pub const SCHEMA: &str = "tvl_pipeline";

pub async fn connect(database_url: &str) -> Result<DbPool> {
    // Retries with capped backoff to survive DNS/startup races in Compose.
    let mut last_err: Option<anyhow::Error> = None;
    let max_attempts: u32 = 10;
    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                log::info!(
                    "✅ Connected to database (attempt {}/{})",
                    attempt,
                    max_attempts
                );
                if let Err(e) = initialize_database(&pool).await {
                    last_err = Some(e);
                } else {
                    return Ok(pool);
                }
            }
            Err(e) => {
                last_err = Some(e.into());
            }
        }
        let delay_ms = (1u64 << attempt.min(6)) * 200;
        log::warn!(
            "DB connect/init attempt {}/{} failed. Retrying in {} ms...",
            attempt,
            max_attempts,
            delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Unknown DB connection error")))
}

pub async fn initialize_database(pool: &DbPool) -> Result<()> {
    const MIGRATION_LOCK_ID: i64 = 0x54564C5F50495045; // "TVL_PIPE"

    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    log::info!("Acquiring database migration lock...");
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA))
        .execute(tx.as_mut())
        .await?;
    create_tables(&mut tx).await?;

    tx.commit().await?;
    log::info!("✅ Database schema ready.");
    Ok(())
}

async fn create_tables(tx: &mut sqlx::Transaction<'_, Postgres>) -> Result<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.block_numbers (
            chain_id BIGINT NOT NULL,
            timestamp BIGINT NOT NULL,
            block_number BIGINT NOT NULL,
            PRIMARY KEY (chain_id, timestamp)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.balances (
            chain_id BIGINT NOT NULL,
            timestamp BIGINT NOT NULL,
            holder VARCHAR(42) NOT NULL,
            asset_id VARCHAR(100) NOT NULL,
            balance VARCHAR(100) NOT NULL,
            PRIMARY KEY (chain_id, timestamp, holder, asset_id)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.total_supplies (
            chain_id BIGINT NOT NULL,
            timestamp BIGINT NOT NULL,
            asset_id VARCHAR(100) NOT NULL,
            total_supply VARCHAR(100) NOT NULL,
            PRIMARY KEY (chain_id, timestamp, asset_id)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.prices (
            timestamp BIGINT NOT NULL,
            asset_id VARCHAR(100) NOT NULL,
            price_usd DOUBLE PRECISION NOT NULL,
            PRIMARY KEY (timestamp, asset_id)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.reports (
            chain_id BIGINT NOT NULL,
            timestamp BIGINT NOT NULL,
            asset_id VARCHAR(100) NOT NULL,
            amount VARCHAR(100) NOT NULL,
            usd_value DOUBLE PRECISION NOT NULL,
            PRIMARY KEY (chain_id, timestamp, asset_id)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.completion_status (
            config_hash VARCHAR(66) NOT NULL,
            timestamp BIGINT NOT NULL,
            chain_id BIGINT NOT NULL,
            kind VARCHAR(30) NOT NULL,
            created_at TIMESTAMPTZ DEFAULT NOW(),
            PRIMARY KEY (config_hash, chain_id, kind, timestamp)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    Ok(())
}

fn address_str(address: Address) -> String {
    format!("{:?}", address)
}

pub struct PostgresBlockNumberStore {
    pool: DbPool,
}

impl PostgresBlockNumberStore {
    pub fn new(pool: DbPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait]
impl RecordStore<BlockNumberRecord> for PostgresBlockNumberStore {
    async fn add_or_update_many(&self, records: &[BlockNumberRecord]) -> Result<usize> {
        let mut written = 0;
        for record in records {
            let result = sqlx::query(&format!(
                "INSERT INTO {}.block_numbers (chain_id, timestamp, block_number)
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                SCHEMA
            ))
            .bind(record.chain_id.as_u64() as i64)
            .bind(record.timestamp.as_secs())
            .bind(record.block_number as i64)
            .execute(&self.pool)
            .await?;
            written += result.rows_affected() as usize;
        }
        Ok(written)
    }

    async fn get_by_timestamp(
        &self,
        chain_id: ChainId,
        timestamp: UnixTime,
    ) -> Result<Vec<BlockNumberRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT block_number FROM {}.block_numbers
             WHERE chain_id = $1 AND timestamp = $2",
            SCHEMA
        ))
        .bind(chain_id.as_u64() as i64)
        .bind(timestamp.as_secs())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(BlockNumberRecord {
                    chain_id,
                    timestamp,
                    block_number: row.try_get::<i64, _>("block_number")? as u64,
                })
            })
            .collect()
    }
}

pub struct PostgresBalanceStore {
    pool: DbPool,
}

impl PostgresBalanceStore {
    pub fn new(pool: DbPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait]
impl RecordStore<BalanceRecord> for PostgresBalanceStore {
    async fn add_or_update_many(&self, records: &[BalanceRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for record in records {
            let result = sqlx::query(&format!(
                "INSERT INTO {}.balances (chain_id, timestamp, holder, asset_id, balance)
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
                SCHEMA
            ))
            .bind(record.chain_id.as_u64() as i64)
            .bind(record.timestamp.as_secs())
            .bind(address_str(record.holder))
            .bind(record.asset_id.as_str())
            .bind(record.balance.to_string())
            .execute(tx.as_mut())
            .await?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn get_by_timestamp(
        &self,
        chain_id: ChainId,
        timestamp: UnixTime,
    ) -> Result<Vec<BalanceRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT holder, asset_id, balance FROM {}.balances
             WHERE chain_id = $1 AND timestamp = $2",
            SCHEMA
        ))
        .bind(chain_id.as_u64() as i64)
        .bind(timestamp.as_secs())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(BalanceRecord {
                    chain_id,
                    timestamp,
                    holder: Address::from_str(&row.try_get::<String, _>("holder")?)?,
                    asset_id: crate::types::AssetId::new(row.try_get::<String, _>("asset_id")?),
                    balance: U256::from_dec_str(&row.try_get::<String, _>("balance")?)?,
                })
            })
            .collect()
    }
}

pub struct PostgresTotalSupplyStore {
    pool: DbPool,
}

impl PostgresTotalSupplyStore {
    pub fn new(pool: DbPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait]
impl RecordStore<TotalSupplyRecord> for PostgresTotalSupplyStore {
    async fn add_or_update_many(&self, records: &[TotalSupplyRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for record in records {
            let result = sqlx::query(&format!(
                "INSERT INTO {}.total_supplies (chain_id, timestamp, asset_id, total_supply)
                 VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
                SCHEMA
            ))
            .bind(record.chain_id.as_u64() as i64)
            .bind(record.timestamp.as_secs())
            .bind(record.asset_id.as_str())
            .bind(record.total_supply.to_string())
            .execute(tx.as_mut())
            .await?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn get_by_timestamp(
        &self,
        chain_id: ChainId,
        timestamp: UnixTime,
    ) -> Result<Vec<TotalSupplyRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT asset_id, total_supply FROM {}.total_supplies
             WHERE chain_id = $1 AND timestamp = $2",
            SCHEMA
        ))
        .bind(chain_id.as_u64() as i64)
        .bind(timestamp.as_secs())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TotalSupplyRecord {
                    chain_id,
                    timestamp,
                    asset_id: crate::types::AssetId::new(row.try_get::<String, _>("asset_id")?),
                    total_supply: U256::from_dec_str(&row.try_get::<String, _>("total_supply")?)?,
                })
            })
            .collect()
    }
}

pub struct PostgresPriceStore {
    pool: DbPool,
}

impl PostgresPriceStore {
    pub fn new(pool: DbPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait]
impl RecordStore<PriceRecord> for PostgresPriceStore {
    async fn add_or_update_many(&self, records: &[PriceRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for record in records {
            let result = sqlx::query(&format!(
                "INSERT INTO {}.prices (timestamp, asset_id, price_usd)
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                SCHEMA
            ))
            .bind(record.timestamp.as_secs())
            .bind(record.asset_id.as_str())
            .bind(record.price_usd)
            .execute(tx.as_mut())
            .await?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    // Prices are chain-agnostic, the chain argument is the offchain pseudo-id.
    async fn get_by_timestamp(
        &self,
        _chain_id: ChainId,
        timestamp: UnixTime,
    ) -> Result<Vec<PriceRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT asset_id, price_usd FROM {}.prices WHERE timestamp = $1",
            SCHEMA
        ))
        .bind(timestamp.as_secs())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(PriceRecord {
                    timestamp,
                    asset_id: crate::types::AssetId::new(row.try_get::<String, _>("asset_id")?),
                    price_usd: row.try_get("price_usd")?,
                })
            })
            .collect()
    }
}

pub struct PostgresReportStore {
    pool: DbPool,
}

impl PostgresReportStore {
    pub fn new(pool: DbPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait]
impl RecordStore<ReportRecord> for PostgresReportStore {
    async fn add_or_update_many(&self, records: &[ReportRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for record in records {
            let result = sqlx::query(&format!(
                "INSERT INTO {}.reports (chain_id, timestamp, asset_id, amount, usd_value)
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
                SCHEMA
            ))
            .bind(record.chain_id.as_u64() as i64)
            .bind(record.timestamp.as_secs())
            .bind(record.asset_id.as_str())
            .bind(record.amount.to_string())
            .bind(record.usd_value)
            .execute(tx.as_mut())
            .await?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn get_by_timestamp(
        &self,
        chain_id: ChainId,
        timestamp: UnixTime,
    ) -> Result<Vec<ReportRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT asset_id, amount, usd_value FROM {}.reports
             WHERE chain_id = $1 AND timestamp = $2",
            SCHEMA
        ))
        .bind(chain_id.as_u64() as i64)
        .bind(timestamp.as_secs())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ReportRecord {
                    chain_id,
                    timestamp,
                    asset_id: crate::types::AssetId::new(row.try_get::<String, _>("asset_id")?),
                    amount: U256::from_dec_str(&row.try_get::<String, _>("amount")?)?,
                    usd_value: row.try_get("usd_value")?,
                })
            })
            .collect()
    }
}

pub struct PostgresCompletionStore {
    pool: DbPool,
}

impl PostgresCompletionStore {
    pub fn new(pool: DbPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait]
impl CompletionStore for PostgresCompletionStore {
    async fn get_by_config_hash(
        &self,
        config_hash: &ConfigHash,
        chain_id: ChainId,
        kind: &str,
    ) -> Result<Vec<UnixTime>> {
        let rows = sqlx::query(&format!(
            "SELECT timestamp FROM {}.completion_status
             WHERE config_hash = $1 AND chain_id = $2 AND kind = $3
             ORDER BY timestamp",
            SCHEMA
        ))
        .bind(config_hash.to_hex())
        .bind(chain_id.as_u64() as i64)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(UnixTime::from_secs(row.try_get("timestamp")?)))
            .collect()
    }

    async fn add(&self, status: CompletionStatus) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {}.completion_status (config_hash, timestamp, chain_id, kind)
             VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
            SCHEMA
        ))
        .bind(status.config_hash.to_hex())
        .bind(status.timestamp.as_secs())
        .bind(status.chain_id.as_u64() as i64)
        .bind(&status.kind)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
