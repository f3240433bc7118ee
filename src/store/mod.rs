//! Reading persistence.
//!
//! Two backends sit behind [`ReadingStore`]: a sharded in-memory store (the
//! default, and what the tests run against) and PostgreSQL. Both make the
//! identity-tuple write a single conditional operation, so two concurrent
//! writers of the same key can never both believe they inserted it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::classifier::{ConflictPolicy, DlqReason, StoredValue};
use crate::config::Config;
use crate::errors::{AnalyticsError, Result};
use crate::models::{normalize_sensor_id, ClassifiedReading, DateRange, Quality, ReadingKey, Scope};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

/// How a conditional write resolved against the stored record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteOutcome {
    Inserted,
    /// Last-write-wins replaced a record holding a different value.
    Superseded { previous: Option<f64> },
    /// Same key and same value; the stored record, and its quality, are left alone.
    Duplicate { stored: Quality },
    /// Reject policy refused a different value; nothing was written.
    Rejected { existing: Option<f64> },
}

/// A reading diverted away from the readings table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub reason: DlqReason,
    pub reading: ClassifiedReading,
}

impl DeadLetter {
    pub fn new(reason: DlqReason, mut reading: ClassifiedReading, received_at: DateTime<Utc>) -> Self {
        // ---
        reading.quality = Quality::Dlq;
        DeadLetter {
            id: Uuid::new_v4(),
            received_at,
            reason,
            reading,
        }
    }
}

/// Marks a device (optionally a single sensor on it) as mid-calibration for one metric.
///
/// Without a `sensor_id` the flag covers every sensor of the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalibrationFlag {
    pub tenant_id: String,
    pub device_id: String,
    pub metric: String,
    #[serde(default)]
    pub sensor_id: Option<String>,
}

impl CalibrationFlag {
    pub fn validate(&self) -> Result<()> {
        // ---
        for (field, v) in [
            ("tenant_id", &self.tenant_id),
            ("device_id", &self.device_id),
            ("metric", &self.metric),
        ] {
            if v.trim().is_empty() {
                return Err(AnalyticsError::validation(format!("{field} is required")));
            }
        }
        Ok(())
    }

    /// Sensor component as stored: the normalized id, or `*` for all sensors.
    pub fn sensor_key(&self) -> String {
        match &self.sensor_id {
            Some(s) => normalize_sensor_id(Some(s)),
            None => ALL_SENSORS.to_string(),
        }
    }
}

pub(crate) const ALL_SENSORS: &str = "*";

#[derive(Clone)]
pub enum ReadingStore {
    Memory(Arc<MemoryStore>),
    Postgres(PgStore),
}

impl ReadingStore {
    /// Open the store the configuration asks for.
    ///
    /// PostgreSQL when `DATABASE_URL` is set (schema created on the way),
    /// otherwise a fresh in-memory store.
    pub async fn connect(cfg: &Config) -> anyhow::Result<Self> {
        // ---
        let Some(db_url) = cfg.db_url.as_deref() else {
            tracing::info!("DATABASE_URL not set, using in-memory store ({} shards)", cfg.store_shards);
            return Ok(ReadingStore::memory(cfg.store_shards));
        };

        tracing::info!("Attempting to connect to database");
        let pool = PgPoolOptions::new()
            .max_connections(cfg.db_pool_max)
            .connect(db_url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;
        tracing::info!("Successfully connected to database");

        crate::schema::create_schema(&pool).await?;
        Ok(ReadingStore::Postgres(PgStore::new(pool)))
    }

    pub fn memory(shards: usize) -> Self {
        ReadingStore::Memory(Arc::new(MemoryStore::new(shards)))
    }

    pub fn backend(&self) -> &'static str {
        match self {
            ReadingStore::Memory(_) => "memory",
            ReadingStore::Postgres(_) => "postgres",
        }
    }

    /// Value stored under `key`, if any record exists.
    pub async fn stored_value(&self, key: &ReadingKey) -> Result<Option<StoredValue>> {
        // ---
        match self {
            ReadingStore::Memory(m) => Ok(m.stored_value(key)),
            ReadingStore::Postgres(p) => p.stored_value(key).await,
        }
    }

    pub async fn is_calibrating(&self, key: &ReadingKey) -> Result<bool> {
        // ---
        match self {
            ReadingStore::Memory(m) => Ok(m.is_calibrating(key)),
            ReadingStore::Postgres(p) => p.is_calibrating(key).await,
        }
    }

    /// Conditionally write a classified reading under its identity tuple.
    pub async fn write(&self, reading: &ClassifiedReading, policy: ConflictPolicy) -> Result<WriteOutcome> {
        // ---
        if reading.quality == Quality::Dlq {
            return Err(AnalyticsError::validation(
                "dlq readings belong in the dead-letter sink",
            ));
        }
        match self {
            ReadingStore::Memory(m) => Ok(m.write(reading, policy)),
            ReadingStore::Postgres(p) => p.write(reading, policy).await,
        }
    }

    pub async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        // ---
        match self {
            ReadingStore::Memory(m) => {
                m.dead_letter(letter.clone());
                Ok(())
            }
            ReadingStore::Postgres(p) => p.dead_letter(letter).await,
        }
    }

    /// Most recent dead letters first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        // ---
        match self {
            ReadingStore::Memory(m) => Ok(m.dead_letters(limit)),
            ReadingStore::Postgres(p) => p.dead_letters(limit).await,
        }
    }

    /// Every stored reading of `metric` inside `scope` and `range`, oldest first.
    pub async fn readings(&self, scope: &Scope, metric: &str, range: &DateRange) -> Result<Vec<ClassifiedReading>> {
        // ---
        match self {
            ReadingStore::Memory(m) => Ok(m.readings(scope, metric, range)),
            ReadingStore::Postgres(p) => p.readings(scope, metric, range).await,
        }
    }

    /// Re-tag a stored reading. The identity tuple never changes.
    pub async fn revise_quality(&self, key: &ReadingKey, quality: Quality) -> Result<ClassifiedReading> {
        // ---
        if matches!(quality, Quality::Raw | Quality::Dlq) {
            return Err(AnalyticsError::validation(format!(
                "cannot revise a stored reading to '{quality}'"
            )));
        }
        let revised = match self {
            ReadingStore::Memory(m) => m.revise_quality(key, quality),
            ReadingStore::Postgres(p) => p.revise_quality(key, quality).await?,
        };
        revised.ok_or_else(|| AnalyticsError::UnknownReading(key.to_string()))
    }

    pub async fn set_calibration(&self, flag: &CalibrationFlag) -> Result<()> {
        // ---
        flag.validate()?;
        match self {
            ReadingStore::Memory(m) => {
                m.set_calibration(flag);
                Ok(())
            }
            ReadingStore::Postgres(p) => p.set_calibration(flag).await,
        }
    }

    /// Returns false when no such flag was set.
    pub async fn clear_calibration(&self, flag: &CalibrationFlag) -> Result<bool> {
        // ---
        flag.validate()?;
        match self {
            ReadingStore::Memory(m) => Ok(m.clear_calibration(flag)),
            ReadingStore::Postgres(p) => p.clear_calibration(flag).await,
        }
    }
}
