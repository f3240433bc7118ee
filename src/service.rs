//! Application service: the pipeline stages wired to the store.
//!
//! Route handlers hold an [`Analytics`] as axum state and call one method per
//! endpoint. The stages themselves stay pure; this layer does the I/O around
//! them (store lookups under a timeout, conditional writes, snapshot loads).

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::{aggregate, AggregateQuery, AggregateWindow, WindowSize};
use crate::alerts::{evaluate, Alert, Thresholds};
use crate::batch::{self, BatchSettings, ScopeOutcome, TrendBatchQuery};
use crate::catalog::MetricCatalog;
use crate::classifier::{Classifier, Conflict, DlqReason, Lookup, Lookups, Verdict};
use crate::comparison::{compare, ComparisonQuery, ComparisonResult};
use crate::config::Config;
use crate::errors::{AnalyticsError, Result};
use crate::models::{ClassifiedReading, DateRange, IngestRequest, Quality, RawMeasurement, ReadingKey, Scope};
use crate::store::{CalibrationFlag, DeadLetter, ReadingStore, WriteOutcome};
use crate::trend::{analyze, TrendQuery, TrendResult};

// ---

/// Outcome of ingesting one reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ingested {
    pub reading: ClassifiedReading,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlq_reason: Option<DlqReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<Conflict>,
    /// A last-write-wins conflict replaced the previously stored value.
    pub superseded: bool,
    /// The same value was already stored; `reading.quality` is the stored one.
    pub duplicate: bool,
}

impl Ingested {
    /// Diverted because the reject policy refused a duplicate identity.
    pub fn is_conflict(&self) -> bool {
        self.dlq_reason == Some(DlqReason::Conflict)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItem {
    Classified { index: usize, result: Ingested },
    Conflict { index: usize, result: Ingested },
    Invalid { index: usize, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub received: usize,
    pub classified: usize,
    pub conflicts: usize,
    pub invalid: usize,
    pub items: Vec<BatchItem>,
}

/// In-place quality revision of a stored reading.
#[derive(Debug, Clone, Deserialize)]
pub struct QualityRevision {
    #[serde(flatten)]
    pub key: ReadingKey,
    pub quality: Quality,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertQuery {
    pub scope: Scope,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub window_size: Option<WindowSize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertReport {
    pub generated_at: DateTime<Utc>,
    pub alerts: Vec<Alert>,
    pub trend: TrendResult,
    /// Absent when the previous period has no readings.
    pub comparison: Option<ComparisonResult>,
}

#[derive(Clone)]
pub struct Analytics {
    store: ReadingStore,
    catalog: Arc<MetricCatalog>,
    config: Arc<Config>,
}

impl Analytics {
    pub fn new(store: ReadingStore, catalog: MetricCatalog, config: Config) -> Self {
        // ---
        Analytics {
            store,
            catalog: Arc::new(catalog),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ReadingStore {
        &self.store
    }

    async fn bounded<T>(&self, lookup: impl Future<Output = Result<T>>) -> Lookup<T> {
        // ---
        match tokio::time::timeout(self.config.lookup_timeout(), lookup).await {
            Ok(Ok(v)) => Lookup::Found(v),
            Ok(Err(e)) => Lookup::Failed(e.to_string()),
            Err(_) => Lookup::TimedOut,
        }
    }

    async fn lookups(&self, key: &ReadingKey) -> Lookups {
        // ---
        let (calibrating, existing) = tokio::join!(
            self.bounded(self.store.is_calibrating(key)),
            self.bounded(self.store.stored_value(key)),
        );
        Lookups { calibrating, existing }
    }

    /// Classify one measurement and persist it (or dead-letter it).
    ///
    /// Never fails: store trouble ends in a `dlq` classification.
    pub async fn ingest(&self, raw: RawMeasurement, now: DateTime<Utc>) -> Ingested {
        // ---
        let policy = self.config.conflict_policy;
        let classifier = Classifier::new(&self.catalog, self.config.stale_after(), policy);

        let mut verdict = match classifier.screen(&raw, now) {
            Some(quality) => Verdict::tagged(quality),
            None => {
                let lookups = self.lookups(&raw.key()).await;
                classifier.resolve(&raw, &lookups)
            }
        };
        let mut reading = raw.into_classified(verdict.quality);
        let mut duplicate = false;

        // The conditional write is the final arbiter: the lookup may have raced
        // with another writer of the same identity tuple.
        if verdict.dlq_reason.is_none() {
            match self.store.write(&reading, policy).await {
                Ok(WriteOutcome::Inserted) => {}
                Ok(WriteOutcome::Duplicate { stored }) => {
                    if stored != reading.quality {
                        debug!(
                            "Reading {} already stored as {}, keeping it over {}",
                            reading.key, stored, reading.quality
                        );
                    }
                    reading.quality = stored;
                    duplicate = true;
                }
                Ok(WriteOutcome::Superseded { previous }) => {
                    verdict.supersedes = true;
                    verdict.conflict.get_or_insert(Conflict {
                        policy,
                        existing_value: previous,
                        incoming_value: reading.value,
                    });
                }
                Ok(WriteOutcome::Rejected { existing }) => {
                    verdict = Verdict {
                        quality: Quality::Dlq,
                        dlq_reason: Some(DlqReason::Conflict),
                        conflict: Some(Conflict {
                            policy,
                            existing_value: existing,
                            incoming_value: reading.value,
                        }),
                        supersedes: false,
                    };
                }
                Err(e) => {
                    error!("Failed to store reading {}: {}", reading.key, e);
                    verdict = Verdict::dead_letter(DlqReason::StoreError);
                }
            }
        }

        let mut dead_letter_id = None;
        if let Some(reason) = verdict.dlq_reason {
            reading.quality = Quality::Dlq;
            let letter = DeadLetter::new(reason, reading.clone(), now);
            warn!("Reading {} diverted to dlq ({})", reading.key, reason.as_str());
            match self.store.dead_letter(&letter).await {
                Ok(()) => dead_letter_id = Some(letter.id),
                Err(e) => error!("Failed to record dead letter for {}: {}", reading.key, e),
            }
        } else {
            debug!("Reading {} classified {}", reading.key, reading.quality);
        }

        Ingested {
            reading,
            dlq_reason: verdict.dlq_reason,
            dead_letter_id,
            conflict: verdict.conflict,
            superseded: verdict.supersedes,
            duplicate,
        }
    }

    /// Ingest untrusted items one by one; a bad item never fails its siblings.
    pub async fn ingest_batch(&self, items: Vec<serde_json::Value>, now: DateTime<Utc>) -> BatchReport {
        // ---
        let batch_id = Uuid::new_v4();
        let received = items.len();
        let mut report_items = Vec::with_capacity(received);
        let (mut classified, mut conflicts, mut invalid) = (0, 0, 0);

        for (index, item) in items.into_iter().enumerate() {
            let raw = match IngestRequest::parse(item) {
                Ok(raw) => raw,
                Err(e) => {
                    invalid += 1;
                    report_items.push(BatchItem::Invalid {
                        index,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let result = self.ingest(raw, now).await;
            if result.is_conflict() {
                conflicts += 1;
                report_items.push(BatchItem::Conflict { index, result });
            } else {
                classified += 1;
                report_items.push(BatchItem::Classified { index, result });
            }
        }

        info!(
            "Batch {} ingested: {} received, {} classified, {} conflicts, {} invalid",
            batch_id, received, classified, conflicts, invalid
        );
        BatchReport {
            batch_id,
            received,
            classified,
            conflicts,
            invalid,
            items: report_items,
        }
    }

    pub async fn revise_quality(&self, revision: &QualityRevision) -> Result<ClassifiedReading> {
        // ---
        let revised = self.store.revise_quality(&revision.key, revision.quality).await?;
        info!("Reading {} revised to {}", revised.key, revised.quality);
        Ok(revised)
    }

    pub async fn set_calibration(&self, flag: &CalibrationFlag) -> Result<()> {
        // ---
        self.store.set_calibration(flag).await?;
        info!(
            "Calibration set for {}/{} '{}' sensor {}",
            flag.tenant_id,
            flag.device_id,
            flag.metric,
            flag.sensor_key()
        );
        Ok(())
    }

    pub async fn clear_calibration(&self, flag: &CalibrationFlag) -> Result<bool> {
        // ---
        let cleared = self.store.clear_calibration(flag).await?;
        info!(
            "Calibration cleared for {}/{} '{}' sensor {} (was set: {})",
            flag.tenant_id,
            flag.device_id,
            flag.metric,
            flag.sensor_key(),
            cleared
        );
        Ok(cleared)
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.store.dead_letters(limit).await
    }

    fn check_metric(metric: &str) -> Result<()> {
        // ---
        if metric.trim().is_empty() {
            return Err(AnalyticsError::validation("metric is required"));
        }
        Ok(())
    }

    pub async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<AggregateWindow>> {
        // ---
        query.scope.validate()?;
        query.date_range.validate()?;
        Self::check_metric(&query.metric)?;

        let readings = self
            .store
            .readings(&query.scope, &query.metric, &query.date_range)
            .await?;
        let spec = self.catalog.spec_for(&query.metric);
        let windows = aggregate(
            &readings,
            query,
            &spec,
            self.config.inclusion(),
            self.config.max_windows,
        )?;

        debug!(
            "Aggregated {} readings of {} '{}' into {} windows",
            readings.len(),
            query.scope,
            query.metric,
            windows.len()
        );
        Ok(windows)
    }

    pub async fn trend(&self, query: &TrendQuery) -> Result<TrendResult> {
        // ---
        let windows = self
            .aggregate(&AggregateQuery {
                scope: query.scope.clone(),
                metric: query.metric.clone(),
                date_range: query.date_range,
                window_size: query.window_size,
            })
            .await?;
        analyze(&query.scope, &query.metric, &windows, query.target_value)
    }

    pub async fn compare(&self, query: &ComparisonQuery) -> Result<ComparisonResult> {
        // ---
        query.validate()?;
        let period = |date_range| TrendQuery {
            scope: query.scope.clone(),
            metric: query.metric.clone(),
            date_range,
            target_value: None,
            window_size: query.window_size,
        };
        let previous = self.trend(&period(query.previous_range)).await?;
        let current = self.trend(&period(query.current_range)).await?;
        compare(previous, current)
    }

    /// Alerts over the latest lookback period, compared with the one before it.
    pub async fn alerts(&self, query: &AlertQuery) -> Result<AlertReport> {
        // ---
        let generated_at = Utc::now();
        let metric = query
            .metric
            .clone()
            .unwrap_or_else(|| self.config.default_metric.clone());
        let current_range = DateRange::new(
            generated_at - Duration::days(i64::from(self.config.alert_lookback_days)),
            generated_at,
        );

        let trend = self
            .trend(&TrendQuery {
                scope: query.scope.clone(),
                metric: metric.clone(),
                date_range: current_range,
                target_value: None,
                window_size: query.window_size,
            })
            .await?;

        let comparison_query = ComparisonQuery {
            scope: query.scope.clone(),
            metric,
            current_range,
            previous_range: current_range.preceding(),
            window_size: query.window_size,
        };
        let comparison = match self.compare(&comparison_query).await {
            Ok(c) => Some(c),
            Err(AnalyticsError::NoReadings { .. }) => None,
            Err(e) => return Err(e),
        };

        let alerts = evaluate(&trend, comparison.as_ref(), &query.thresholds, generated_at);
        info!("Evaluated alerts for {}: {} fired", query.scope, alerts.len());
        Ok(AlertReport {
            generated_at,
            alerts,
            trend,
            comparison,
        })
    }

    /// Trends for several scopes, computed in parallel off the async runtime.
    pub async fn trends_batch(&self, query: TrendBatchQuery) -> Result<Vec<ScopeOutcome>> {
        // ---
        query.date_range.validate()?;
        Self::check_metric(&query.metric)?;
        if query.scopes.is_empty() {
            return Err(AnalyticsError::validation("scopes must not be empty"));
        }

        let mut snapshots = Vec::with_capacity(query.scopes.len());
        for scope in &query.scopes {
            // Invalid scopes still get a slot; the aggregator reports them.
            let readings = match scope.validate() {
                Ok(()) => self.store.readings(scope, &query.metric, &query.date_range).await,
                Err(_) => Ok(Vec::new()),
            };
            snapshots.push((scope.clone(), readings));
        }

        let settings = BatchSettings {
            spec: self.catalog.spec_for(&query.metric),
            inclusion: self.config.inclusion(),
            max_windows: self.config.max_windows,
        };
        let outcomes =
            tokio::task::spawn_blocking(move || batch::trends(&query, snapshots, &settings)).await?;
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::classifier::ConflictPolicy;
    use crate::models::ReadingPayload;
    use chrono::TimeZone;

    fn analytics(policy: ConflictPolicy) -> Analytics {
        // ---
        let config = Config {
            conflict_policy: policy,
            ..Config::default()
        };
        Analytics::new(ReadingStore::memory(4), MetricCatalog::builtin(), config)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn measurement(value: f64) -> RawMeasurement {
        // ---
        RawMeasurement {
            time: now() - Duration::hours(2),
            tenant_id: "tenant-1".into(),
            device_id: "scale-A".into(),
            metric: "weight".into(),
            sensor_id: Some("Cell 1".into()),
            value: Some(value),
            payload: ReadingPayload::default(),
        }
    }

    #[tokio::test]
    async fn test_ingest_clean_then_conflict_under_reject() {
        // ---
        let svc = analytics(ConflictPolicy::Reject);

        let first = svc.ingest(measurement(250.0), now()).await;
        assert_eq!(first.reading.quality, Quality::Clean);
        assert_eq!(first.reading.key.sensor_id_norm, "cell-1");

        let second = svc.ingest(measurement(260.0), now()).await;
        assert!(second.is_conflict());
        assert_eq!(second.reading.quality, Quality::Dlq);
        assert_eq!(second.conflict.as_ref().unwrap().existing_value, Some(250.0));
        assert!(second.dead_letter_id.is_some());

        let letters = svc.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DlqReason::Conflict);
    }

    #[tokio::test]
    async fn test_last_write_wins_supersedes() {
        // ---
        let svc = analytics(ConflictPolicy::LastWriteWins);
        svc.ingest(measurement(250.0), now()).await;
        let second = svc.ingest(measurement(260.0), now()).await;

        assert!(second.superseded);
        assert_eq!(second.reading.quality, Quality::Clean);
        let stored = svc.store().stored_value(&second.reading.key).await.unwrap();
        assert_eq!(stored.and_then(|s| s.0), Some(260.0));
    }

    #[tokio::test]
    async fn test_calibration_and_screened_readings() {
        // ---
        let svc = analytics(ConflictPolicy::LastWriteWins);
        let flag = CalibrationFlag {
            tenant_id: "tenant-1".into(),
            device_id: "scale-A".into(),
            metric: "weight".into(),
            sensor_id: None,
        };
        svc.set_calibration(&flag).await.unwrap();
        assert_eq!(svc.ingest(measurement(250.0), now()).await.reading.quality, Quality::Calibrating);

        let mut old = measurement(250.0);
        old.time = now() - Duration::days(10);
        assert_eq!(svc.ingest(old, now()).await.reading.quality, Quality::Stale);

        assert!(svc.clear_calibration(&flag).await.unwrap());
    }

    #[tokio::test]
    async fn test_redelivery_reports_stored_quality() {
        // ---
        let svc = analytics(ConflictPolicy::LastWriteWins);
        let first = svc.ingest(measurement(250.0), now()).await;
        assert_eq!(first.reading.quality, Quality::Clean);
        assert!(!first.duplicate);

        let flag = CalibrationFlag {
            tenant_id: "tenant-1".into(),
            device_id: "scale-A".into(),
            metric: "weight".into(),
            sensor_id: None,
        };
        svc.set_calibration(&flag).await.unwrap();

        let again = svc.ingest(measurement(250.0), now()).await;
        assert!(again.duplicate);
        assert!(!again.superseded);
        assert_eq!(again.reading.quality, Quality::Clean);

        let range = DateRange::new(now() - Duration::days(1), now());
        let stored = svc.store().readings(&Scope::tenant("tenant-1"), "weight", &range).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].quality, Quality::Clean);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_lookup_times_out_to_dlq() {
        // ---
        let svc = analytics(ConflictPolicy::Reject);
        let started = tokio::time::Instant::now();

        let stalled = svc.bounded(std::future::pending::<Result<bool>>()).await;
        assert_eq!(stalled, Lookup::TimedOut);
        assert!(started.elapsed() >= svc.config().lookup_timeout());

        let failed = svc
            .bounded(async { Err::<bool, _>(AnalyticsError::validation("store down")) })
            .await;
        assert!(matches!(failed, Lookup::Failed(_)));
        assert_eq!(svc.bounded(async { Ok(false) }).await, Lookup::Found(false));

        let lookups = Lookups {
            calibrating: stalled,
            existing: Lookup::Found(None),
        };
        let classifier = Classifier::new(&svc.catalog, svc.config().stale_after(), ConflictPolicy::Reject);
        let verdict = classifier.resolve(&measurement(250.0), &lookups);
        assert_eq!(verdict.quality, Quality::Dlq);
        assert_eq!(verdict.dlq_reason, Some(DlqReason::LookupTimeout));
    }

    #[tokio::test]
    async fn test_batch_isolates_bad_items() {
        // ---
        let svc = analytics(ConflictPolicy::Reject);
        let good = serde_json::json!({
            "time": "2025-06-01T10:00:00Z",
            "tenant_id": "tenant-1",
            "device_id": "scale-A",
            "metric": "weight",
            "value": 250.0
        });
        let mut clash = good.clone();
        clash["value"] = serde_json::json!(255.0);
        let items = vec![good, serde_json::json!({ "tenant_id": "tenant-1" }), clash];

        let report = svc.ingest_batch(items, now()).await;
        assert_eq!((report.received, report.classified, report.conflicts, report.invalid), (3, 1, 1, 1));
        assert!(matches!(report.items[1], BatchItem::Invalid { index: 1, .. }));
        assert!(matches!(report.items[2], BatchItem::Conflict { index: 2, .. }));
    }

    #[tokio::test]
    async fn test_trend_without_readings_is_reported() {
        // ---
        let svc = analytics(ConflictPolicy::Reject);
        let query = TrendQuery {
            scope: Scope::tenant("tenant-1"),
            metric: "weight".into(),
            date_range: DateRange::new(now() - Duration::days(7), now()),
            target_value: None,
            window_size: None,
        };
        assert!(matches!(svc.trend(&query).await, Err(AnalyticsError::NoReadings { .. })));
    }

    #[tokio::test]
    async fn test_revise_quality() {
        // ---
        let svc = analytics(ConflictPolicy::Reject);
        let ingested = svc.ingest(measurement(250.0), now()).await;

        let revision = QualityRevision {
            key: ingested.reading.key.clone(),
            quality: Quality::Anomaly,
        };
        assert_eq!(svc.revise_quality(&revision).await.unwrap().quality, Quality::Anomaly);

        let to_dlq = QualityRevision {
            quality: Quality::Dlq,
            ..revision
        };
        assert!(matches!(svc.revise_quality(&to_dlq).await, Err(AnalyticsError::Validation(_))));
    }
}
