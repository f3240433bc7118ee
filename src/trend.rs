//! Growth trend and target-date projection over an aggregate window sequence.
//!
//! Division by zero never leaks out as NaN or infinity: the affected figure
//! is reported as `0` and a [`Warning`] code is attached to the result.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregator::{AggregateWindow, WindowSize};
use crate::errors::{AnalyticsError, Result};
use crate::models::{DateRange, Scope};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Warning {
    DegenerateGrowthRate,
    DegenerateCumulativeGrowth,
    DegenerateUniformity,
    DegenerateElapsedDays,
    DegenerateFeedRatio,
    DegenerateSurvivalRate,
    DegenerateComparison,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendQuery {
    pub scope: Scope,
    pub metric: String,
    pub date_range: DateRange,
    #[serde(default)]
    pub target_value: Option<f64>,
    #[serde(default)]
    pub window_size: Option<WindowSize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Projection {
    Defined {
        target_value: f64,
        estimated_days: i64,
        projected_date: NaiveDate,
    },
    /// Average daily gain is zero or negative; the target is never reached.
    NoPositiveGrowth { target_value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub window_start: DateTime<Utc>,
    pub mean: f64,
    pub cumulative_growth_pct: f64,
    pub uniformity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendResult {
    pub scope: Scope,
    pub metric: String,
    pub start_value: f64,
    pub end_value: f64,
    pub total_growth: f64,
    pub elapsed_days: i64,
    pub average_daily_gain: f64,
    pub growth_rate_pct: f64,
    pub specific_growth_rate: Option<f64>,
    /// Uniformity of the latest non-empty window.
    pub uniformity: Option<f64>,
    /// `stddev / mean` of the latest non-empty window.
    pub coefficient_of_variation: Option<f64>,
    pub feed_efficiency: Option<f64>,
    pub feed_conversion_ratio: Option<f64>,
    pub survival_rate: Option<f64>,
    pub first_observed: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
    pub points: Vec<TrendPoint>,
    pub projection: Option<Projection>,
    pub warnings: Vec<Warning>,
}

impl TrendResult {
    /// Calendar date projections are anchored to.
    pub fn as_of(&self) -> NaiveDate {
        self.last_observed.date_naive()
    }
}

fn note(warnings: &mut Vec<Warning>, w: Warning) {
    // ---
    if !warnings.contains(&w) {
        warnings.push(w);
    }
}

/// `num / den`, or `0` plus a warning when `den` is zero.
fn guarded(num: f64, den: f64, warning: Warning, warnings: &mut Vec<Warning>) -> f64 {
    // ---
    if den == 0.0 {
        note(warnings, warning);
        0.0
    } else {
        num / den
    }
}

/// `clip(100 - stddev / mean * 100, 0, 100)`.
pub fn uniformity(stddev: f64, mean: f64, warnings: &mut Vec<Warning>) -> f64 {
    // ---
    let cv = guarded(stddev, mean, Warning::DegenerateUniformity, warnings);
    if mean == 0.0 {
        return 0.0;
    }
    (100.0 - cv * 100.0).clamp(0.0, 100.0)
}

/// Days until `target_value` is reached at the current average daily gain.
pub fn project(end_value: f64, average_daily_gain: f64, target_value: f64, as_of: NaiveDate) -> Projection {
    // ---
    if average_daily_gain <= 0.0 {
        return Projection::NoPositiveGrowth { target_value };
    }
    let remaining = target_value - end_value;
    let estimated_days = if remaining <= 0.0 {
        0
    } else {
        (remaining / average_daily_gain).ceil() as i64
    };
    Projection::Defined {
        target_value,
        estimated_days,
        projected_date: as_of + Duration::days(estimated_days),
    }
}

/// Distinct calendar days from the first window's start to the last window's
/// end, both inclusive. Empty windows in between still count.
fn calendar_days_spanned(first: &AggregateWindow, last: &AggregateWindow) -> i64 {
    // ---
    let last_instant = last
        .window_end
        .checked_sub_signed(Duration::nanoseconds(1))
        .map_or(last.window_start, |end| end.max(last.window_start));
    (last_instant.date_naive() - first.window_start.date_naive()).num_days() + 1
}

/// Derive the growth trend of an ascending window sequence.
pub fn analyze(
    scope: &Scope,
    metric: &str,
    windows: &[AggregateWindow],
    target_value: Option<f64>,
) -> Result<TrendResult> {
    // ---
    let observed: Vec<(&AggregateWindow, f64)> = windows
        .iter()
        .filter_map(|w| w.mean.filter(|_| !w.is_empty()).map(|m| (w, m)))
        .collect();

    let (Some(&(first, start_value)), Some(&(last, end_value))) = (observed.first(), observed.last())
    else {
        return Err(AnalyticsError::NoReadings {
            scope: scope.to_string(),
            metric: metric.to_string(),
        });
    };

    let mut warnings = Vec::new();
    let total_growth = end_value - start_value;
    let elapsed_days = calendar_days_spanned(first, last);
    let average_daily_gain = guarded(
        total_growth,
        elapsed_days as f64,
        Warning::DegenerateElapsedDays,
        &mut warnings,
    );
    let growth_rate_pct = guarded(total_growth, start_value, Warning::DegenerateGrowthRate, &mut warnings) * 100.0;

    let specific_growth_rate = (start_value > 0.0 && end_value > 0.0 && elapsed_days > 0)
        .then(|| (end_value.ln() - start_value.ln()) / elapsed_days as f64 * 100.0);

    let points: Vec<TrendPoint> = observed
        .iter()
        .map(|&(w, mean)| TrendPoint {
            window_start: w.window_start,
            mean,
            cumulative_growth_pct: guarded(
                mean - start_value,
                start_value,
                Warning::DegenerateCumulativeGrowth,
                &mut warnings,
            ) * 100.0,
            uniformity: uniformity(w.stddev.unwrap_or(0.0), mean, &mut warnings),
        })
        .collect();

    let feed = windows.iter().filter_map(|w| w.feed).fold(None, |acc: Option<(f64, f64)>, f| {
        let (gain, consumed) = acc.unwrap_or((0.0, 0.0));
        Some((gain + f.weight_gain, consumed + f.feed_consumed))
    });
    let (feed_efficiency, feed_conversion_ratio) = match feed {
        Some((gain, consumed)) => (
            Some(guarded(gain, consumed, Warning::DegenerateFeedRatio, &mut warnings)),
            Some(guarded(consumed, gain, Warning::DegenerateFeedRatio, &mut warnings)),
        ),
        None => (None, None),
    };

    let head_counts: Vec<u32> = windows.iter().filter_map(|w| w.head_count).collect();
    let survival_rate = match (head_counts.first(), head_counts.last()) {
        (Some(&initial), Some(&current)) => Some(
            guarded(
                f64::from(current),
                f64::from(initial),
                Warning::DegenerateSurvivalRate,
                &mut warnings,
            ) * 100.0,
        ),
        _ => None,
    };

    let latest_uniformity = points.last().map(|p| p.uniformity);
    let as_of = last.window_start.date_naive();

    Ok(TrendResult {
        scope: scope.clone(),
        metric: metric.to_string(),
        start_value,
        end_value,
        total_growth,
        elapsed_days,
        average_daily_gain,
        growth_rate_pct,
        specific_growth_rate,
        uniformity: latest_uniformity,
        coefficient_of_variation: last.coefficient_of_variation(),
        feed_efficiency,
        feed_conversion_ratio,
        survival_rate,
        first_observed: first.window_start,
        last_observed: last.window_start,
        points,
        projection: target_value.map(|t| project(end_value, average_daily_gain, t, as_of)),
        warnings,
    })
}
