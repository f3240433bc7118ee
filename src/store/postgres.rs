//! PostgreSQL reading store.
//!
//! The identity tuple is the table's composite primary key. A write first
//! tries `INSERT ... ON CONFLICT DO NOTHING`; when the key already exists the
//! stored row is locked with `SELECT ... FOR UPDATE` and the conflict policy
//! decides inside the same transaction.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{CalibrationFlag, DeadLetter, WriteOutcome, ALL_SENSORS};
use crate::classifier::{ConflictPolicy, StoredValue};
use crate::errors::Result;
use crate::models::{ClassifiedReading, DateRange, Quality, ReadingKey, ReadingPayload, Scope};

// ---

const READING_COLUMNS: &str = "time, tenant_id, device_id, metric, sensor_id_norm, \
                               sensor_id, value, quality, payload";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct ReadingRow {
    time: DateTime<Utc>,
    tenant_id: String,
    device_id: String,
    metric: String,
    sensor_id_norm: String,
    sensor_id: Option<String>,
    value: Option<f64>,
    quality: String,
    payload: Json<ReadingPayload>,
}

impl TryFrom<ReadingRow> for ClassifiedReading {
    type Error = crate::errors::AnalyticsError;

    fn try_from(row: ReadingRow) -> Result<Self> {
        // ---
        Ok(ClassifiedReading {
            key: ReadingKey {
                time: row.time,
                tenant_id: row.tenant_id,
                device_id: row.device_id,
                metric: row.metric,
                sensor_id_norm: row.sensor_id_norm,
            },
            sensor_id: row.sensor_id,
            value: row.value,
            quality: row.quality.parse()?,
            payload: row.payload.0,
        })
    }
}

#[derive(Debug, FromRow)]
struct DeadLetterRow {
    id: Uuid,
    received_at: DateTime<Utc>,
    reason: String,
    reading: Json<ClassifiedReading>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub async fn stored_value(&self, key: &ReadingKey) -> Result<Option<StoredValue>> {
        // ---
        let row: Option<(Option<f64>,)> = sqlx::query_as(
            r#"
            SELECT value FROM readings
            WHERE time = $1 AND tenant_id = $2 AND device_id = $3
              AND metric = $4 AND sensor_id_norm = $5
            "#,
        )
        .bind(key.time)
        .bind(&key.tenant_id)
        .bind(&key.device_id)
        .bind(&key.metric)
        .bind(&key.sensor_id_norm)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value,)| StoredValue(value)))
    }

    pub async fn is_calibrating(&self, key: &ReadingKey) -> Result<bool> {
        // ---
        let (found,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM calibrations
                WHERE tenant_id = $1 AND device_id = $2 AND metric = $3
                  AND sensor_id_norm IN ($4, $5)
            )
            "#,
        )
        .bind(&key.tenant_id)
        .bind(&key.device_id)
        .bind(&key.metric)
        .bind(&key.sensor_id_norm)
        .bind(ALL_SENSORS)
        .fetch_one(&self.pool)
        .await?;

        Ok(found)
    }

    pub async fn write(&self, reading: &ClassifiedReading, policy: ConflictPolicy) -> Result<WriteOutcome> {
        // ---
        let key = &reading.key;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO readings ({READING_COLUMNS}, farm_id, pen_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (time, tenant_id, device_id, metric, sensor_id_norm) DO NOTHING
            "#
        ))
        .bind(key.time)
        .bind(&key.tenant_id)
        .bind(&key.device_id)
        .bind(&key.metric)
        .bind(&key.sensor_id_norm)
        .bind(&reading.sensor_id)
        .bind(reading.value)
        .bind(reading.quality.as_str())
        .bind(Json(&reading.payload))
        .bind(&reading.payload.farm_id)
        .bind(&reading.payload.pen_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            tx.commit().await?;
            return Ok(WriteOutcome::Inserted);
        }

        let (existing, stored): (Option<f64>, String) = sqlx::query_as(
            r#"
            SELECT value, quality FROM readings
            WHERE time = $1 AND tenant_id = $2 AND device_id = $3
              AND metric = $4 AND sensor_id_norm = $5
            FOR UPDATE
            "#,
        )
        .bind(key.time)
        .bind(&key.tenant_id)
        .bind(&key.device_id)
        .bind(&key.metric)
        .bind(&key.sensor_id_norm)
        .fetch_one(&mut *tx)
        .await?;

        let outcome = if existing == reading.value {
            WriteOutcome::Duplicate {
                stored: stored.parse()?,
            }
        } else {
            match policy {
                ConflictPolicy::Reject => WriteOutcome::Rejected { existing },
                ConflictPolicy::LastWriteWins => {
                    sqlx::query(
                        r#"
                        UPDATE readings
                        SET sensor_id = $6, value = $7, quality = $8, payload = $9,
                            farm_id = $10, pen_id = $11
                        WHERE time = $1 AND tenant_id = $2 AND device_id = $3
                          AND metric = $4 AND sensor_id_norm = $5
                        "#,
                    )
                    .bind(key.time)
                    .bind(&key.tenant_id)
                    .bind(&key.device_id)
                    .bind(&key.metric)
                    .bind(&key.sensor_id_norm)
                    .bind(&reading.sensor_id)
                    .bind(reading.value)
                    .bind(reading.quality.as_str())
                    .bind(Json(&reading.payload))
                    .bind(&reading.payload.farm_id)
                    .bind(&reading.payload.pen_id)
                    .execute(&mut *tx)
                    .await?;
                    WriteOutcome::Superseded { previous: existing }
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, received_at, reason, reading)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(letter.id)
        .bind(letter.received_at)
        .bind(letter.reason.as_str())
        .bind(Json(&letter.reading))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        // ---
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            r#"
            SELECT id, received_at, reason, reading FROM dead_letters
            ORDER BY received_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<DeadLetter> {
                Ok(DeadLetter {
                    id: row.id,
                    received_at: row.received_at,
                    reason: row.reason.parse()?,
                    reading: row.reading.0,
                })
            })
            .collect()
    }

    pub async fn readings(&self, scope: &Scope, metric: &str, range: &DateRange) -> Result<Vec<ClassifiedReading>> {
        // ---
        let rows: Vec<ReadingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {READING_COLUMNS} FROM readings
            WHERE tenant_id = $1 AND metric = $2
              AND time >= $3 AND time < $4
              AND ($5::TEXT IS NULL OR farm_id = $5)
              AND ($6::TEXT IS NULL OR pen_id = $6)
              AND ($7::TEXT IS NULL OR device_id = $7)
            ORDER BY time
            "#
        ))
        .bind(&scope.tenant_id)
        .bind(metric)
        .bind(range.start)
        .bind(range.end)
        .bind(&scope.farm_id)
        .bind(&scope.pen_id)
        .bind(&scope.device_id)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!("Loaded {} readings for {} '{}'", rows.len(), scope, metric);
        rows.into_iter().map(ClassifiedReading::try_from).collect()
    }

    pub async fn revise_quality(&self, key: &ReadingKey, quality: Quality) -> Result<Option<ClassifiedReading>> {
        // ---
        let row: Option<ReadingRow> = sqlx::query_as(&format!(
            r#"
            UPDATE readings SET quality = $6
            WHERE time = $1 AND tenant_id = $2 AND device_id = $3
              AND metric = $4 AND sensor_id_norm = $5
            RETURNING {READING_COLUMNS}
            "#
        ))
        .bind(key.time)
        .bind(&key.tenant_id)
        .bind(&key.device_id)
        .bind(&key.metric)
        .bind(&key.sensor_id_norm)
        .bind(quality.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ClassifiedReading::try_from).transpose()
    }

    pub async fn set_calibration(&self, flag: &CalibrationFlag) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO calibrations (tenant_id, device_id, metric, sensor_id_norm)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&flag.tenant_id)
        .bind(&flag.device_id)
        .bind(&flag.metric)
        .bind(flag.sensor_key())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn clear_calibration(&self, flag: &CalibrationFlag) -> Result<bool> {
        // ---
        let removed = sqlx::query(
            r#"
            DELETE FROM calibrations
            WHERE tenant_id = $1 AND device_id = $2 AND metric = $3 AND sensor_id_norm = $4
            "#,
        )
        .bind(&flag.tenant_id)
        .bind(&flag.device_id)
        .bind(&flag.metric)
        .bind(flag.sensor_key())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(removed > 0)
    }
}
