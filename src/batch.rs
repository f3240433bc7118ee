//! Multi-scope trend computation on the rayon pool.
//!
//! Each scope works on its own immutable snapshot of readings; nothing is
//! shared between scopes while they run, and the results are merged in input
//! order at the end.

use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregator::{aggregate, AggregateQuery, Inclusion, WindowSize};
use crate::errors::Result;
use crate::catalog::MetricSpec;
use crate::models::{ClassifiedReading, DateRange, Scope};
use crate::trend::{analyze, TrendResult};

// ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendBatchQuery {
    pub scopes: Vec<Scope>,
    pub metric: String,
    pub date_range: DateRange,
    #[serde(default)]
    pub target_value: Option<f64>,
    #[serde(default)]
    pub window_size: Option<WindowSize>,
}

/// Per-scope result; a failed scope never hides the others.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScopeOutcome {
    Ok { scope: Scope, trend: TrendResult },
    Failed { scope: Scope, error: String },
}

impl ScopeOutcome {
    pub fn scope(&self) -> &Scope {
        match self {
            ScopeOutcome::Ok { scope, .. } | ScopeOutcome::Failed { scope, .. } => scope,
        }
    }
}

/// Settings shared by every scope of one batch.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub spec: MetricSpec,
    pub inclusion: Inclusion,
    pub max_windows: usize,
}

/// Readings of one scope, or the error that kept them from being loaded.
pub type Snapshot = (Scope, Result<Vec<ClassifiedReading>>);

/// Compute one trend per scope snapshot in parallel.
pub fn trends(query: &TrendBatchQuery, snapshots: Vec<Snapshot>, settings: &BatchSettings) -> Vec<ScopeOutcome> {
    // ---
    let started = Instant::now();
    let outcomes: Vec<ScopeOutcome> = snapshots
        .into_par_iter()
        .map(|(scope, loaded)| {
            let readings = match loaded {
                Ok(readings) => readings,
                Err(e) => {
                    warn!("Readings for {} could not be loaded: {}", scope, e);
                    return ScopeOutcome::Failed {
                        scope,
                        error: e.to_string(),
                    };
                }
            };
            let aggregate_query = AggregateQuery {
                scope: scope.clone(),
                metric: query.metric.clone(),
                date_range: query.date_range,
                window_size: query.window_size,
            };
            let result = aggregate(
                &readings,
                &aggregate_query,
                &settings.spec,
                settings.inclusion,
                settings.max_windows,
            )
            .and_then(|windows| analyze(&scope, &query.metric, &windows, query.target_value));

            match result {
                Ok(trend) => ScopeOutcome::Ok { scope, trend },
                Err(e) => {
                    warn!("Trend for {} failed: {}", scope, e);
                    ScopeOutcome::Failed {
                        scope,
                        error: e.to_string(),
                    }
                }
            }
        })
        .collect();

    debug!(
        "Computed {} scope trends in {}ms",
        outcomes.len(),
        started.elapsed().as_millis()
    );
    outcomes
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::errors::AnalyticsError;
    use crate::models::{Quality, RawMeasurement, ReadingPayload};
    use chrono::{Duration, TimeZone, Utc};

    fn pen(pen_id: &str) -> Scope {
        Scope {
            pen_id: Some(pen_id.into()),
            ..Scope::tenant("tenant-1")
        }
    }

    fn readings(pen_id: &str, start: f64, gain: f64) -> Vec<ClassifiedReading> {
        // ---
        let day0 = Utc.with_ymd_and_hms(2025, 4, 1, 6, 0, 0).unwrap();
        // Ten daily readings, gaining `gain` per calendar day spanned.
        (0..10)
            .map(|d| {
                RawMeasurement {
                    time: day0 + Duration::days(d),
                    tenant_id: "tenant-1".into(),
                    device_id: format!("scale-{pen_id}"),
                    metric: "weight".into(),
                    sensor_id: None,
                    value: Some(start + gain * 10.0 * d as f64 / 9.0),
                    payload: ReadingPayload {
                        pen_id: Some(pen_id.into()),
                        ..ReadingPayload::default()
                    },
                }
                .into_classified(Quality::Clean)
            })
            .collect()
    }

    #[test]
    fn test_scopes_are_computed_independently() {
        // ---
        let query = TrendBatchQuery {
            scopes: vec![pen("pen-1"), pen("pen-2"), pen("pen-3")],
            metric: "weight".into(),
            date_range: DateRange::new(
                Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 4, 12, 0, 0, 0).unwrap(),
            ),
            target_value: None,
            window_size: None,
        };
        let settings = BatchSettings {
            spec: MetricSpec::unconstrained(),
            inclusion: Inclusion::CleanOnly,
            max_windows: 100,
        };
        let snapshots = vec![
            (pen("pen-1"), Ok(readings("pen-1", 200.0, 5.0))),
            (pen("pen-2"), Ok(Vec::new())),
            (pen("pen-3"), Ok(readings("pen-3", 300.0, 9.0))),
        ];

        let outcomes = trends(&query, snapshots, &settings);

        assert_eq!(outcomes.len(), 3);
        let scopes: Vec<_> = outcomes.iter().map(|o| o.scope().pen_id.clone()).collect();
        assert_eq!(scopes, vec![Some("pen-1".into()), Some("pen-2".into()), Some("pen-3".into())]);

        match &outcomes[0] {
            ScopeOutcome::Ok { trend, .. } => assert!((trend.average_daily_gain - 5.0).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(outcomes[1], ScopeOutcome::Failed { .. }));
        match &outcomes[2] {
            ScopeOutcome::Ok { trend, .. } => assert!((trend.average_daily_gain - 9.0).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_failed_load_only_fails_its_scope() {
        // ---
        let query = TrendBatchQuery {
            scopes: vec![pen("pen-1"), pen("pen-2"), pen("pen-3")],
            metric: "weight".into(),
            date_range: DateRange::new(
                Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 4, 11, 0, 0, 0).unwrap(),
            ),
            target_value: None,
            window_size: None,
        };
        let settings = BatchSettings {
            spec: MetricSpec::unconstrained(),
            inclusion: Inclusion::CleanOnly,
            max_windows: 100,
        };
        let snapshots = vec![
            (pen("pen-1"), Ok(readings("pen-1", 200.0, 5.0))),
            (pen("pen-2"), Err(AnalyticsError::Database(sqlx::Error::PoolTimedOut))),
            (pen("pen-3"), Ok(readings("pen-3", 300.0, 9.0))),
        ];

        let outcomes = trends(&query, snapshots, &settings);

        assert!(matches!(outcomes[0], ScopeOutcome::Ok { .. }));
        match &outcomes[1] {
            ScopeOutcome::Failed { scope, error } => {
                assert_eq!(scope, &pen("pen-2"));
                assert!(!error.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(outcomes[2], ScopeOutcome::Ok { .. }));
    }
}
