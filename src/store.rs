use crate::presence::PresenceCacheEntry;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// A device's last known position, persisted exactly once per offline
/// episode. One row per device key, upserted in place, never appended.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LastKnownPosition {
    pub device_key: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub battery: Option<f64>,
    pub worker: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub persisted_at: DateTime<Utc>,
}

impl LastKnownPosition {
    pub fn from_entry(entry: &PresenceCacheEntry, persisted_at: DateTime<Utc>) -> Self {
        Self {
            device_key: entry.reading.device_key.clone(),
            lat: entry.reading.lat,
            lon: entry.reading.lon,
            battery: entry.reading.battery,
            worker: entry.reading.worker.clone(),
            last_seen: entry.reading.received_at,
            persisted_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The single write operation this core requires from a durable store.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn upsert(&self, position: &LastKnownPosition) -> Result<(), StoreError>;
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgPositionStore {
    pool: PgPool,
}

impl PgPositionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent at startup; deployments that run their own migrations
    /// get a no-op.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS last_known_positions (
                device_key text primary key,
                lat double precision null,
                lon double precision null,
                battery double precision null,
                worker_ref text null,
                last_seen timestamptz not null,
                persisted_at timestamptz not null
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PositionStore for PgPositionStore {
    /// One row per device key; a second offline episode overwrites the
    /// first row in place rather than appending.
    async fn upsert(&self, position: &LastKnownPosition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO last_known_positions
                (device_key, lat, lon, battery, worker_ref, last_seen, persisted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (device_key) DO UPDATE
            SET lat = EXCLUDED.lat,
                lon = EXCLUDED.lon,
                battery = EXCLUDED.battery,
                worker_ref = EXCLUDED.worker_ref,
                last_seen = EXCLUDED.last_seen,
                persisted_at = EXCLUDED.persisted_at
            "#,
        )
        .bind(&position.device_key)
        .bind(position.lat)
        .bind(position.lon)
        .bind(position.battery)
        .bind(&position.worker)
        .bind(position.last_seen)
        .bind(position.persisted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Ok(pool)
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_device() -> Result<()> {
        if env::var("HELMET_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(());
        }
        let database_url = match env::var("HELMET_TEST_DATABASE_URL") {
            Ok(value) => value,
            Err(_) => return Ok(()),
        };

        let schema = format!("helmet_test_{}", std::process::id());
        let pool = setup_test_pool(&database_url, &schema).await?;
        let store = PgPositionStore::new(pool.clone());
        store.ensure_schema().await?;

        let now = Utc::now();
        let mut position = LastKnownPosition {
            device_key: "AA:BB:CC:DD:EE:FF".to_string(),
            lat: Some(21.0),
            lon: Some(105.8),
            battery: Some(44.0),
            worker: Some("W-104".to_string()),
            last_seen: now,
            persisted_at: now,
        };
        store.upsert(&position).await?;

        position.lat = Some(21.5);
        position.battery = Some(12.0);
        store.upsert(&position).await?;

        let (count, lat): (i64, Option<f64>) = sqlx::query_as(
            "SELECT COUNT(*) OVER (), lat FROM last_known_positions WHERE device_key = $1",
        )
        .bind(&position.device_key)
        .fetch_one(&pool)
        .await?;
        assert_eq!(count, 1);
        assert_eq!(lat, Some(21.5));

        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await?;
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .execute(&admin_pool)
            .await;

        Ok(())
    }
}

