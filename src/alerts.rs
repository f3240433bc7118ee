//! Threshold alerts over the latest trend and comparison.
//!
//! Every rule is evaluated independently; one firing never suppresses
//! another. The engine holds no state, so identical inputs always yield the
//! identical alert list in the same order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::comparison::{ComparisonResult, Indicator};
use crate::models::Scope;
use crate::trend::TrendResult;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    SlowGrowth,
    LowUniformity,
    HighVariation,
    ExcellentGrowth,
    GrowthDecline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Named thresholds; any field left out of a request keeps its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Average daily gain below this fires `slow_growth`.
    pub growth_floor: f64,
    pub uniformity_floor: f64,
    /// Coefficient of variation (stddev / mean) above this fires `high_variation`.
    pub variation_ceiling: f64,
    pub growth_ceiling: f64,
    pub uniformity_excellent: f64,
    /// ADG drop versus the previous period, in percent, that fires `growth_decline`.
    pub decline_pct: Option<f64>,
}

impl Default for Thresholds {
    fn default() -> Self {
        // ---
        Thresholds {
            growth_floor: 5.0,
            uniformity_floor: 80.0,
            variation_ceiling: 0.2,
            growth_ceiling: 8.0,
            uniformity_excellent: 85.0,
            decline_pct: Some(10.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub scope: Scope,
    pub generated_at: DateTime<Utc>,
}

pub fn evaluate(
    trend: &TrendResult,
    comparison: Option<&ComparisonResult>,
    thresholds: &Thresholds,
    generated_at: DateTime<Utc>,
) -> Vec<Alert> {
    // ---
    let adg = trend.average_daily_gain;
    let mut alerts = Vec::new();
    let mut fire = |alert_type, severity, message: String| {
        alerts.push(Alert {
            alert_type,
            severity,
            message,
            scope: trend.scope.clone(),
            generated_at,
        })
    };

    if adg < thresholds.growth_floor {
        fire(
            AlertType::SlowGrowth,
            Severity::High,
            format!(
                "{} {}: average daily gain {:.2} is below the floor of {:.2}",
                trend.scope, trend.metric, adg, thresholds.growth_floor
            ),
        );
    }

    if let Some(u) = trend.uniformity.filter(|u| *u < thresholds.uniformity_floor) {
        fire(
            AlertType::LowUniformity,
            Severity::Medium,
            format!(
                "{} {}: uniformity {:.1}% is below the floor of {:.1}%",
                trend.scope, trend.metric, u, thresholds.uniformity_floor
            ),
        );
    }

    if let Some(cv) = trend
        .coefficient_of_variation
        .filter(|cv| *cv > thresholds.variation_ceiling)
    {
        fire(
            AlertType::HighVariation,
            Severity::Medium,
            format!(
                "{} {}: coefficient of variation {:.3} exceeds the ceiling of {:.3}",
                trend.scope, trend.metric, cv, thresholds.variation_ceiling
            ),
        );
    }

    if let Some(u) = trend.uniformity {
        if adg > thresholds.growth_ceiling && u > thresholds.uniformity_excellent {
            fire(
                AlertType::ExcellentGrowth,
                Severity::Low,
                format!(
                    "{} {}: average daily gain {:.2} with uniformity {:.1}% exceeds {:.2} / {:.1}%",
                    trend.scope,
                    trend.metric,
                    adg,
                    u,
                    thresholds.growth_ceiling,
                    thresholds.uniformity_excellent
                ),
            );
        }
    }

    let decline = comparison.and_then(|c| c.improvement(Indicator::AverageDailyGain));
    if let (Some(change), Some(limit)) = (decline, thresholds.decline_pct) {
        if change < -limit {
            fire(
                AlertType::GrowthDecline,
                Severity::Medium,
                format!(
                    "{} {}: average daily gain changed {:.1}% versus the previous period (limit -{:.1}%)",
                    trend.scope, trend.metric, change, limit
                ),
            );
        }
    }

    alerts
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::comparison::compare;
    use chrono::{Duration, TimeZone};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 6, 0, 0).unwrap()
    }

    fn trend(adg: f64, uniformity: Option<f64>, cv: Option<f64>) -> TrendResult {
        // ---
        TrendResult {
            scope: Scope::tenant("tenant-1"),
            metric: "weight".into(),
            start_value: 200.0,
            end_value: 200.0 + adg * 30.0,
            total_growth: adg * 30.0,
            elapsed_days: 30,
            average_daily_gain: adg,
            growth_rate_pct: adg * 30.0 / 2.0,
            specific_growth_rate: None,
            uniformity,
            coefficient_of_variation: cv,
            feed_efficiency: None,
            feed_conversion_ratio: None,
            survival_rate: None,
            first_observed: at() - Duration::days(30),
            last_observed: at(),
            points: Vec::new(),
            projection: None,
            warnings: Vec::new(),
        }
    }

    fn types(alerts: &[Alert]) -> Vec<AlertType> {
        alerts.iter().map(|a| a.alert_type).collect()
    }

    #[test]
    fn test_slow_growth_is_not_suppressed_by_uniformity() {
        // ---
        let alerts = evaluate(&trend(4.0, Some(92.0), Some(0.08)), None, &Thresholds::default(), at());

        assert_eq!(types(&alerts), vec![AlertType::SlowGrowth]);
        assert_eq!(alerts[0].severity, Severity::High);
        assert!(alerts[0].message.contains("4.00"));
        assert!(alerts[0].message.contains("5.00"));
        assert_eq!(alerts[0].generated_at, at());
    }

    #[test]
    fn test_rules_fire_independently() {
        // ---
        let alerts = evaluate(&trend(3.0, Some(70.0), Some(0.3)), None, &Thresholds::default(), at());
        assert_eq!(
            types(&alerts),
            vec![AlertType::SlowGrowth, AlertType::LowUniformity, AlertType::HighVariation]
        );
        assert_eq!(alerts[1].severity, Severity::Medium);
        assert_eq!(alerts[2].severity, Severity::Medium);
    }

    #[test]
    fn test_excellent_growth() {
        // ---
        let alerts = evaluate(&trend(9.0, Some(90.0), Some(0.1)), None, &Thresholds::default(), at());
        assert_eq!(types(&alerts), vec![AlertType::ExcellentGrowth]);
        assert_eq!(alerts[0].severity, Severity::Low);

        // Both conditions are required.
        let alerts = evaluate(&trend(9.0, Some(84.0), Some(0.1)), None, &Thresholds::default(), at());
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_growth_decline_uses_comparison() {
        // ---
        let previous = trend(8.0, Some(88.0), Some(0.1));
        let current = trend(6.0, Some(88.0), Some(0.1));
        let comparison = compare(previous, current.clone()).unwrap();

        let alerts = evaluate(&current, Some(&comparison), &Thresholds::default(), at());
        assert_eq!(types(&alerts), vec![AlertType::GrowthDecline]);

        let relaxed = Thresholds {
            decline_pct: None,
            ..Thresholds::default()
        };
        assert!(evaluate(&current, Some(&comparison), &relaxed, at()).is_empty());
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        // ---
        let t = trend(3.0, Some(70.0), Some(0.3));
        let thresholds = Thresholds::default();
        assert_eq!(evaluate(&t, None, &thresholds, at()), evaluate(&t, None, &thresholds, at()));
    }

    #[test]
    fn test_partial_thresholds_keep_defaults() {
        // ---
        let t: Thresholds = serde_json::from_str(r#"{ "growth_floor": 2.5 }"#).unwrap();
        assert_eq!(t.growth_floor, 2.5);
        assert_eq!(t.uniformity_floor, 80.0);
        assert_eq!(t.decline_pct, Some(10.0));
    }
}
