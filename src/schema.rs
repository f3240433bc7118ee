//! Database schema management for `growthflow-analytics`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup when the PostgreSQL store is opened.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the `readings` table keyed by the identity tuple, the
/// `dead_letters` sink and the `calibrations` flags. Safe to call on every
/// startup; no-op if objects already exist.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // One row per identity tuple. `dlq` never lands here.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readings (
            time            TIMESTAMPTZ      NOT NULL,
            tenant_id       TEXT             NOT NULL,
            device_id       TEXT             NOT NULL,
            metric          TEXT             NOT NULL,
            sensor_id_norm  TEXT             NOT NULL,
            sensor_id       TEXT,
            value           DOUBLE PRECISION,
            quality         TEXT             NOT NULL
                CHECK (quality IN ('raw', 'clean', 'anomaly', 'stale', 'invalid', 'calibrating')),
            farm_id         TEXT,
            pen_id          TEXT,
            payload         JSONB            NOT NULL DEFAULT '{}'::jsonb,
            PRIMARY KEY (time, tenant_id, device_id, metric, sensor_id_norm)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id           UUID PRIMARY KEY,
            received_at  TIMESTAMPTZ NOT NULL,
            reason       TEXT        NOT NULL
                CHECK (reason IN ('conflict', 'lookup_timeout', 'store_error')),
            reading      JSONB       NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // `*` in sensor_id_norm flags every sensor of the device.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calibrations (
            tenant_id       TEXT        NOT NULL,
            device_id       TEXT        NOT NULL,
            metric          TEXT        NOT NULL,
            sensor_id_norm  TEXT        NOT NULL,
            set_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (tenant_id, device_id, metric, sensor_id_norm)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Aggregation scans by tenant, metric and time range
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_readings_tenant_metric_time
            ON readings (tenant_id, metric, time);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_dead_letters_received_at
            ON dead_letters (received_at DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
