//! Period-over-period comparison of two trend results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregator::WindowSize;
use crate::errors::{AnalyticsError, Result};
use crate::models::{DateRange, Scope};
use crate::trend::{TrendResult, Warning};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    AverageDailyGain,
    SpecificGrowthRate,
    GrowthRate,
    SurvivalRate,
    Uniformity,
    FeedEfficiency,
    FeedConversionRatio,
}

impl Indicator {
    pub const ALL: [Indicator; 7] = [
        Indicator::AverageDailyGain,
        Indicator::SpecificGrowthRate,
        Indicator::GrowthRate,
        Indicator::SurvivalRate,
        Indicator::Uniformity,
        Indicator::FeedEfficiency,
        Indicator::FeedConversionRatio,
    ];

    pub fn direction(self) -> Direction {
        // ---
        match self {
            Indicator::AverageDailyGain
            | Indicator::SpecificGrowthRate
            | Indicator::GrowthRate
            | Indicator::SurvivalRate
            | Indicator::Uniformity
            | Indicator::FeedEfficiency => Direction::HigherIsBetter,
            Indicator::FeedConversionRatio => Direction::LowerIsBetter,
        }
    }

    pub fn value(self, trend: &TrendResult) -> Option<f64> {
        // ---
        match self {
            Indicator::AverageDailyGain => Some(trend.average_daily_gain),
            Indicator::SpecificGrowthRate => trend.specific_growth_rate,
            Indicator::GrowthRate => Some(trend.growth_rate_pct),
            Indicator::SurvivalRate => trend.survival_rate,
            Indicator::Uniformity => trend.uniformity,
            Indicator::FeedEfficiency => trend.feed_efficiency,
            Indicator::FeedConversionRatio => trend.feed_conversion_ratio,
        }
    }
}

/// Improvement in percent, positive when `current` is better.
///
/// `None` when `previous` is zero.
pub fn improvement_pct(indicator: Indicator, previous: f64, current: f64) -> Option<f64> {
    // ---
    if previous == 0.0 {
        return None;
    }
    let delta = match indicator.direction() {
        Direction::HigherIsBetter => current - previous,
        Direction::LowerIsBetter => previous - current,
    };
    Some(delta / previous * 100.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonQuery {
    pub scope: Scope,
    pub metric: String,
    pub current_range: DateRange,
    pub previous_range: DateRange,
    #[serde(default)]
    pub window_size: Option<WindowSize>,
}

impl ComparisonQuery {
    /// Periods must have equal length and `previous` must end where `current` starts.
    pub fn validate(&self) -> Result<()> {
        // ---
        self.scope.validate()?;
        self.current_range.validate()?;
        self.previous_range.validate()?;
        if self.previous_range.length() != self.current_range.length() {
            return Err(AnalyticsError::validation(
                "current_range and previous_range must have equal length",
            ));
        }
        if self.previous_range.end != self.current_range.start {
            return Err(AnalyticsError::validation(
                "previous_range must end where current_range starts",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonWarning {
    pub indicator: Indicator,
    pub code: Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub scope: Scope,
    pub metric: String,
    pub improvements: BTreeMap<Indicator, f64>,
    pub warnings: Vec<ComparisonWarning>,
    pub previous: TrendResult,
    pub current: TrendResult,
}

impl ComparisonResult {
    pub fn improvement(&self, indicator: Indicator) -> Option<f64> {
        self.improvements.get(&indicator).copied()
    }
}

/// Diff two trends of the same scope and metric.
pub fn compare(previous: TrendResult, current: TrendResult) -> Result<ComparisonResult> {
    // ---
    if previous.scope != current.scope || previous.metric != current.metric {
        return Err(AnalyticsError::validation(format!(
            "cannot compare {} '{}' with {} '{}'",
            previous.scope, previous.metric, current.scope, current.metric
        )));
    }

    let mut improvements = BTreeMap::new();
    let mut warnings = Vec::new();
    for indicator in Indicator::ALL {
        let (Some(prev), Some(cur)) = (indicator.value(&previous), indicator.value(&current)) else {
            continue;
        };
        match improvement_pct(indicator, prev, cur) {
            Some(pct) => {
                improvements.insert(indicator, pct);
            }
            None => {
                improvements.insert(indicator, 0.0);
                warnings.push(ComparisonWarning {
                    indicator,
                    code: Warning::DegenerateComparison,
                });
            }
        }
    }

    Ok(ComparisonResult {
        scope: current.scope.clone(),
        metric: current.metric.clone(),
        improvements,
        warnings,
        previous,
        current,
    })
}
