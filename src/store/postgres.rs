//! Postgres-backed `StoreGateway`. Chosen over the teacher's ClickHouse
//! client because spec.md §6 names a JSONB extras column and §4.1/§5
//! require an atomic, serializable per-protocol counter for short-ID
//! allocation — guarantees ClickHouse's append-only model doesn't offer.
//! The migration-on-open and `sqlx::FromRow` row-mapping style is lifted
//! from the teacher's `ConfigDb` (`rusqlite`, `CREATE TABLE IF NOT EXISTS`
//! run at startup) and generalized to an async connection pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashSet;

use crate::error::StoreError;
use crate::model::device::{Device, DeviceRegistration, Protocol};
use crate::model::telemetry::TelemetryRecord;

use super::StoreGateway;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        id               UUID PRIMARY KEY,
        canonical_key    TEXT NOT NULL UNIQUE,
        imei             TEXT UNIQUE,
        protocol         TEXT NOT NULL CHECK (protocol IN ('tfms90', 'teltonika')),
        short_device_id  INTEGER,
        firmware_version TEXT,
        sim_iccid        TEXT,
        last_seen        TIMESTAMPTZ,
        is_active        BOOLEAN NOT NULL DEFAULT TRUE,
        UNIQUE (protocol, short_device_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS short_id_counters (
        protocol TEXT PRIMARY KEY,
        next_id  INTEGER NOT NULL DEFAULT 100
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS telemetry_data (
        id                   BIGSERIAL PRIMARY KEY,
        canonical_device_key TEXT NOT NULL,
        timestamp            TIMESTAMPTZ NOT NULL,
        latitude             DOUBLE PRECISION,
        longitude            DOUBLE PRECISION,
        altitude             DOUBLE PRECISION,
        speed                DOUBLE PRECISION,
        heading              DOUBLE PRECISION,
        satellites           INTEGER,
        fuel_level           DOUBLE PRECISION,
        ignition             BOOLEAN,
        protocol             TEXT NOT NULL,
        message_type         TEXT NOT NULL,
        start_timestamp      TIMESTAMPTZ,
        end_timestamp        TIMESTAMPTZ,
        duration_seconds     BIGINT,
        start_fuel           DOUBLE PRECISION,
        end_fuel             DOUBLE PRECISION,
        distance_km          DOUBLE PRECISION,
        start_latitude       DOUBLE PRECISION,
        start_longitude      DOUBLE PRECISION,
        io_elements          JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at           TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_telemetry_device_ts
        ON telemetry_data (canonical_device_key, timestamp DESC)
    "#,
];

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> anyhow::Result<()> {
        for stmt in MIGRATIONS {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        tracing::info!("store migrations applied");
        Ok(())
    }
}

fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Transient(err),
        _ => StoreError::Other(err),
    }
}

#[async_trait]
impl StoreGateway for PgStore {
    async fn lookup_by_imei(&self, imei: &str) -> Result<Option<Device>, StoreError> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT id, canonical_key, imei, protocol, short_device_id, firmware_version, \
             sim_iccid, last_seen, is_active FROM devices WHERE imei = $1",
        )
        .bind(imei)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        Ok(device)
    }

    async fn allocate_short_id(&self, protocol: Protocol) -> Result<i32, StoreError> {
        // INSERT ... ON CONFLICT DO UPDATE makes first-touch seeding (100)
        // and subsequent increments race-free under one statement — no
        // explicit SELECT-then-UPDATE window for two first-contact devices
        // to land the same ID (spec.md §5 "Shared state").
        let allocated: i32 = sqlx::query_scalar(
            "INSERT INTO short_id_counters (protocol, next_id) VALUES ($1, 101) \
             ON CONFLICT (protocol) DO UPDATE SET next_id = short_id_counters.next_id + 1 \
             RETURNING next_id - 1",
        )
        .bind(protocol.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        Ok(allocated)
    }

    async fn register_device(&self, patch: DeviceRegistration) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE devices SET canonical_key = $1, short_device_id = $2, \
             firmware_version = $3, sim_iccid = $4, last_seen = $5 WHERE id = $6",
        )
        .bind(&patch.canonical_key)
        .bind(patch.short_id)
        .bind(&patch.firmware_version)
        .bind(&patch.sim_iccid)
        .bind(patch.last_seen)
        .bind(patch.device_id)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn touch_last_seen(&self, canonical_key: &str, ts: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE devices SET last_seen = $1 WHERE canonical_key = $2")
            .bind(ts)
            .bind(canonical_key)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn insert_telemetry(&self, record: &TelemetryRecord) -> Result<i64, StoreError> {
        // `extras` is the only thing serialized to JSON here; every other
        // field binds to its own typed column (spec.md §4.1/§9 — no
        // auto-unnesting of the free-form bag).
        let extras = serde_json::to_value(&record.extras).unwrap_or_else(|_| serde_json::json!({}));

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO telemetry_data (
                canonical_device_key, timestamp, latitude, longitude, altitude, speed,
                heading, satellites, fuel_level, ignition, protocol, message_type,
                start_timestamp, end_timestamp, duration_seconds, start_fuel, end_fuel,
                distance_km, start_latitude, start_longitude, io_elements
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            RETURNING id",
        )
        .bind(&record.canonical_device_key)
        .bind(record.timestamp)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.altitude)
        .bind(record.speed)
        .bind(record.heading)
        .bind(record.satellites)
        .bind(record.fuel_level)
        .bind(record.ignition)
        .bind(record.protocol.as_str())
        .bind(record.message_type.as_str())
        .bind(record.start_timestamp)
        .bind(record.end_timestamp)
        .bind(record.duration_seconds)
        .bind(record.start_fuel)
        .bind(record.end_fuel)
        .bind(record.distance_km)
        .bind(record.start_latitude)
        .bind(record.start_longitude)
        .bind(extras)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        Ok(id)
    }

    async fn registered_imeis(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT imei FROM devices WHERE imei IS NOT NULL")
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        Ok(rows.into_iter().filter_map(|row| row.try_get::<String, _>("imei").ok()).collect())
    }
}
