//! Periodic aggregator: fixed, contiguous windows of summary statistics.
//!
//! Windows are aligned to multiples of the window size since the Unix epoch,
//! so daily windows start at 00:00 UTC. Every window of the requested range
//! is returned, including empty ones (`count == 0`, statistics `None`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::MetricSpec;
use crate::errors::{AnalyticsError, Result};
use crate::models::{ClassifiedReading, DateRange, Quality, Scope};

// ---

/// Which qualities feed the statistics and with what weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Inclusion {
    CleanOnly,
    /// Also include `anomaly` and `stale` readings at a reduced weight.
    WithDegraded { weight: f64 },
}

impl Inclusion {
    /// Confidence weight of a reading, `None` when it is excluded.
    pub fn weight(self, quality: Quality) -> Option<f64> {
        // ---
        match quality {
            Quality::Clean => Some(1.0),
            Quality::Anomaly | Quality::Stale => match self {
                Inclusion::CleanOnly => None,
                Inclusion::WithDegraded { weight } => Some(weight),
            },
            Quality::Raw | Quality::Invalid | Quality::Calibrating | Quality::Dlq => None,
        }
    }
}

/// Window length, written as `<n>s`, `<n>m`, `<n>h`, `<n>d` or `<n>w`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WindowSize(Duration);

impl WindowSize {
    /// Longest accepted window: one leap year.
    pub const MAX_DAYS: i64 = 366;

    pub fn new(length: Duration) -> Result<Self> {
        // ---
        if length < Duration::seconds(1) {
            return Err(AnalyticsError::validation("window_size must be at least 1s"));
        }
        if length > Duration::days(Self::MAX_DAYS) {
            return Err(AnalyticsError::validation(format!(
                "window_size must not exceed {}d",
                Self::MAX_DAYS
            )));
        }
        Ok(WindowSize(length))
    }

    pub fn daily() -> Self {
        WindowSize(Duration::days(1))
    }

    pub fn length(self) -> Duration {
        self.0
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::daily()
    }
}

impl FromStr for WindowSize {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        let s = s.trim();
        let Some((split, _)) = s.char_indices().last() else {
            return Err(AnalyticsError::validation("window_size must not be empty"));
        };
        let (digits, unit) = s.split_at(split);
        let n: i64 = digits
            .parse()
            .map_err(|_| AnalyticsError::validation(format!("invalid window_size '{s}'")))?;
        let length = match unit {
            "s" => Duration::try_seconds(n),
            "m" => Duration::try_minutes(n),
            "h" => Duration::try_hours(n),
            "d" => Duration::try_days(n),
            "w" => Duration::try_weeks(n),
            _ => {
                return Err(AnalyticsError::validation(format!(
                    "invalid window_size unit in '{s}' (use s, m, h, d or w)"
                )))
            }
        };
        let length =
            length.ok_or_else(|| AnalyticsError::validation(format!("window_size '{s}' is out of range")))?;
        WindowSize::new(length)
    }
}

impl TryFrom<String> for WindowSize {
    type Error = AnalyticsError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let secs = self.0.num_seconds();
        match secs {
            s if s % 604_800 == 0 => write!(f, "{}w", s / 604_800),
            s if s % 86_400 == 0 => write!(f, "{}d", s / 86_400),
            s if s % 3_600 == 0 => write!(f, "{}h", s / 3_600),
            s if s % 60 == 0 => write!(f, "{}m", s / 60),
            s => write!(f, "{s}s"),
        }
    }
}

impl From<WindowSize> for String {
    fn from(w: WindowSize) -> String {
        w.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub scope: Scope,
    pub metric: String,
    pub date_range: DateRange,
    #[serde(default)]
    pub window_size: Option<WindowSize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketShare {
    pub label: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeedTotals {
    pub weight_gain: f64,
    pub feed_consumed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateWindow {
    pub scope: Scope,
    pub metric: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub count: usize,
    /// Sum of confidence weights; equals `count` in clean-only mode.
    pub weight_sum: f64,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Population standard deviation.
    pub stddev: Option<f64>,
    pub distribution: Vec<BucketShare>,
    pub biomass: Option<f64>,
    pub feed_efficiency: Option<f64>,
    pub feed: Option<FeedTotals>,
    /// Latest head count reported inside the window.
    pub head_count: Option<u32>,
}

impl AggregateWindow {
    fn empty(scope: &Scope, metric: &str, start: DateTime<Utc>, size: Duration) -> Result<Self> {
        // ---
        let window_end = start
            .checked_add_signed(size)
            .ok_or_else(|| AnalyticsError::validation("window end out of range"))?;
        Ok(AggregateWindow {
            scope: scope.clone(),
            metric: metric.to_string(),
            window_start: start,
            window_end,
            count: 0,
            weight_sum: 0.0,
            mean: None,
            min: None,
            max: None,
            stddev: None,
            distribution: Vec::new(),
            biomass: None,
            feed_efficiency: None,
            feed: None,
            head_count: None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// `stddev / mean`, `None` for empty windows or a zero mean.
    pub fn coefficient_of_variation(&self) -> Option<f64> {
        // ---
        match (self.stddev, self.mean) {
            (Some(sd), Some(mean)) if mean != 0.0 => Some(sd / mean),
            _ => None,
        }
    }
}

/// Start instants of every window covering `range`.
pub fn window_starts(
    range: &DateRange,
    size: WindowSize,
    max_windows: usize,
) -> Result<Vec<DateTime<Utc>>> {
    // ---
    range.validate()?;
    let step = size.length().num_seconds();
    let first = range.start.timestamp() - range.start.timestamp().rem_euclid(step);
    let span = range.end.timestamp() - first;
    // Sub-second tails still need a window of their own.
    let tail = i64::from(range.end.timestamp_subsec_nanos() > 0);
    let count = ((span + tail + step - 1) / step).max(1) as usize;

    if count > max_windows {
        return Err(AnalyticsError::validation(format!(
            "range needs {count} windows of {size}, limit is {max_windows}"
        )));
    }

    (0..count as i64)
        .map(|i| {
            DateTime::from_timestamp(first + i * step, 0)
                .ok_or_else(|| AnalyticsError::validation("window start out of range"))
        })
        .collect()
}

struct Sample<'a> {
    value: f64,
    weight: f64,
    reading: &'a ClassifiedReading,
}

/// Build the full window sequence for one scope and metric.
pub fn aggregate(
    readings: &[ClassifiedReading],
    query: &AggregateQuery,
    spec: &MetricSpec,
    inclusion: Inclusion,
    max_windows: usize,
) -> Result<Vec<AggregateWindow>> {
    // ---
    query.scope.validate()?;
    let size = query.window_size.unwrap_or_default();
    let starts = window_starts(&query.date_range, size, max_windows)?;
    let first = starts[0];
    let step = size.length().num_seconds();

    let mut buckets: Vec<Vec<Sample<'_>>> = starts.iter().map(|_| Vec::new()).collect();
    for reading in readings {
        if reading.key.metric != query.metric
            || !query.scope.contains(reading)
            || !query.date_range.contains(reading.key.time)
        {
            continue;
        }
        let (Some(value), Some(weight)) = (reading.value, inclusion.weight(reading.quality))
        else {
            continue;
        };
        let idx = ((reading.key.time.timestamp() - first.timestamp()) / step) as usize;
        if let Some(bucket) = buckets.get_mut(idx) {
            bucket.push(Sample {
                value,
                weight,
                reading,
            });
        }
    }

    starts
        .into_iter()
        .zip(buckets)
        .map(|(start, mut samples)| {
            let mut window = AggregateWindow::empty(&query.scope, &query.metric, start, size.length())?;
            samples.sort_by_key(|s| s.reading.key.time);
            summarize(&mut window, &samples, spec);
            Ok(window)
        })
        .collect()
}

fn summarize(window: &mut AggregateWindow, samples: &[Sample<'_>], spec: &MetricSpec) {
    // ---
    let weight_sum: f64 = samples.iter().map(|s| s.weight).sum();
    if samples.is_empty() || weight_sum <= 0.0 {
        return;
    }

    let mean = samples.iter().map(|s| s.weight * s.value).sum::<f64>() / weight_sum;
    let variance = samples
        .iter()
        .map(|s| s.weight * (s.value - mean).powi(2))
        .sum::<f64>()
        / weight_sum;
    let min = samples.iter().map(|s| s.value).fold(f64::INFINITY, f64::min);
    let max = samples.iter().map(|s| s.value).fold(f64::NEG_INFINITY, f64::max);

    window.count = samples.len();
    window.weight_sum = weight_sum;
    window.mean = Some(mean);
    window.min = Some(min);
    window.max = Some(max);
    window.stddev = Some(variance.sqrt());
    window.biomass = spec.biomass(mean, samples.len());
    window.distribution = distribution(samples, spec, weight_sum);

    let mut feed: Option<FeedTotals> = None;
    for s in samples {
        if let (Some(gain), Some(consumed)) =
            (s.reading.payload.weight_gain, s.reading.payload.feed_consumed)
        {
            let totals = feed.get_or_insert(FeedTotals {
                weight_gain: 0.0,
                feed_consumed: 0.0,
            });
            totals.weight_gain += gain;
            totals.feed_consumed += consumed;
        }
    }
    window.feed = feed;
    window.feed_efficiency = feed
        .filter(|f| f.feed_consumed > 0.0)
        .map(|f| f.weight_gain / f.feed_consumed);

    window.head_count = samples.iter().rev().find_map(|s| s.reading.payload.head_count);
}

fn distribution(samples: &[Sample<'_>], spec: &MetricSpec, weight_sum: f64) -> Vec<BucketShare> {
    // ---
    let labels = spec.bucket_labels();
    let mut counts = vec![0usize; labels.len()];
    let mut weights = vec![0.0f64; labels.len()];
    if labels.is_empty() {
        return Vec::new();
    }
    for s in samples {
        let idx = spec.bucket_index(s.value);
        counts[idx] += 1;
        weights[idx] += s.weight;
    }
    labels
        .into_iter()
        .zip(counts.into_iter().zip(weights))
        .map(|(label, (count, weight))| BucketShare {
            label,
            count,
            percentage: weight / weight_sum * 100.0,
        })
        .collect()
}
