//! Data models for the growth analytics pipeline.
//!
//! Wire types (`IngestRequest`) are validated once at the boundary and turned
//! into `RawMeasurement`; the classifier then produces `ClassifiedReading`,
//! which is what the store persists and the aggregator consumes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AnalyticsError, Result};

// ---

/// Placeholder `sensor_id_norm` for readings without a usable sensor id.
pub const ANONYMOUS_SENSOR: &str = "_none";

/// Quality tag attached to every classified reading.
///
/// The literal set is shared with upstream and downstream collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Raw,
    Clean,
    Anomaly,
    Stale,
    Invalid,
    Calibrating,
    Dlq,
}

impl Quality {
    pub const ALL: [Quality; 7] = [
        Quality::Raw,
        Quality::Clean,
        Quality::Anomaly,
        Quality::Stale,
        Quality::Invalid,
        Quality::Calibrating,
        Quality::Dlq,
    ];

    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            Quality::Raw => "raw",
            Quality::Clean => "clean",
            Quality::Anomaly => "anomaly",
            Quality::Stale => "stale",
            Quality::Invalid => "invalid",
            Quality::Calibrating => "calibrating",
            Quality::Dlq => "dlq",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        Quality::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| AnalyticsError::validation(format!("unknown quality '{s}'")))
    }
}

/// Structured reading attributes, validated when the reading is ingested.
///
/// Known fields are typed; anything else lands in `extensions` so metric
/// specific producers can attach their own attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadingPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub farm_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pen_id: Option<String>,
    /// Animals present in the sampled population.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_count: Option<u32>,
    /// Weight gained since the previous sample, same unit as the metric.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_gain: Option<f64>,
    /// Feed consumed over the same interval as `weight_gain`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_consumed: Option<f64>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl ReadingPayload {
    /// Parse and validate an untrusted payload object.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        // ---
        if !value.is_object() {
            return Err(AnalyticsError::validation("payload must be a JSON object"));
        }
        let payload: ReadingPayload = serde_json::from_value(value)
            .map_err(|e| AnalyticsError::validation(format!("payload: {e}")))?;

        for (field, id) in [("farm_id", &payload.farm_id), ("pen_id", &payload.pen_id)] {
            if id.as_deref().is_some_and(|s| s.trim().is_empty()) {
                return Err(AnalyticsError::validation(format!(
                    "payload: {field} must not be blank"
                )));
            }
        }
        for (field, amount) in [
            ("weight_gain", payload.weight_gain),
            ("feed_consumed", payload.feed_consumed),
        ] {
            if amount.is_some_and(|v| !v.is_finite()) {
                return Err(AnalyticsError::validation(format!(
                    "payload: {field} must be finite"
                )));
            }
        }
        if payload.feed_consumed.is_some_and(|v| v < 0.0) {
            return Err(AnalyticsError::validation(
                "payload: feed_consumed must not be negative",
            ));
        }
        Ok(payload)
    }
}

/// Ingestion request as received from collaborators.
///
/// Everything is optional here so a missing field becomes a validation error
/// with a readable message instead of a generic deserialization failure.
#[derive(Debug, Default, Deserialize)]
pub struct IngestRequest {
    // ---
    pub time: Option<DateTime<Utc>>,
    pub tenant_id: Option<String>,
    pub device_id: Option<String>,
    pub metric: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    pub sensor_id: Option<String>,
    pub payload: Option<serde_json::Value>,
}

/// A well-formed measurement that has not been classified yet.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMeasurement {
    // ---
    pub time: DateTime<Utc>,
    pub tenant_id: String,
    pub device_id: String,
    pub metric: String,
    pub sensor_id: Option<String>,
    /// `None` when the value was absent or not numeric.
    pub value: Option<f64>,
    pub payload: ReadingPayload,
}

fn required(field: &str, value: Option<String>) -> Result<String> {
    // ---
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AnalyticsError::validation(format!("{field} is required"))),
    }
}

impl IngestRequest {
    // ---
    /// Decode one untrusted JSON item, isolating its failure from siblings.
    pub fn parse(item: serde_json::Value) -> Result<RawMeasurement> {
        let request: IngestRequest = serde_json::from_value(item)
            .map_err(|e| AnalyticsError::validation(format!("malformed reading: {e}")))?;
        request.validate()
    }

    pub fn validate(self) -> Result<RawMeasurement> {
        // ---
        let time = self
            .time
            .ok_or_else(|| AnalyticsError::validation("time is required"))?;
        let tenant_id = required("tenant_id", self.tenant_id)?;
        let device_id = required("device_id", self.device_id)?;
        let metric = required("metric", self.metric)?;

        let value = match self.value {
            Some(serde_json::Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()),
            _ => None,
        };
        let payload = match self.payload {
            None | Some(serde_json::Value::Null) => ReadingPayload::default(),
            Some(p) => ReadingPayload::from_json(p)?,
        };

        Ok(RawMeasurement {
            time,
            tenant_id,
            device_id,
            metric,
            sensor_id: self.sensor_id,
            value,
            payload,
        })
    }
}

/// Canonical form of a sensor identifier.
///
/// Lower-cased, trimmed, inner whitespace collapsed to `-`, anything outside
/// `[a-z0-9._:-]` dropped. Absent or empty ids map to [`ANONYMOUS_SENSOR`].
pub fn normalize_sensor_id(sensor_id: Option<&str>) -> String {
    // ---
    let Some(raw) = sensor_id else {
        return ANONYMOUS_SENSOR.to_string();
    };
    let canonical = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
        .collect::<String>();

    if canonical.is_empty() {
        ANONYMOUS_SENSOR.to_string()
    } else {
        canonical
    }
}

/// Identity tuple of a reading; at most one stored record per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadingKey {
    pub time: DateTime<Utc>,
    pub tenant_id: String,
    pub device_id: String,
    pub metric: String,
    pub sensor_id_norm: String,
}

impl fmt::Display for ReadingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}@{}",
            self.tenant_id,
            self.device_id,
            self.metric,
            self.sensor_id_norm,
            self.time.to_rfc3339()
        )
    }
}

impl RawMeasurement {
    pub fn key(&self) -> ReadingKey {
        // ---
        ReadingKey {
            time: self.time,
            tenant_id: self.tenant_id.clone(),
            device_id: self.device_id.clone(),
            metric: self.metric.clone(),
            sensor_id_norm: normalize_sensor_id(self.sensor_id.as_deref()),
        }
    }

    /// Attach a quality tag, producing the record the store persists.
    pub fn into_classified(self, quality: Quality) -> ClassifiedReading {
        // ---
        ClassifiedReading {
            key: self.key(),
            sensor_id: self.sensor_id,
            value: self.value,
            quality,
            payload: self.payload,
        }
    }
}

/// A reading after classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedReading {
    #[serde(flatten)]
    pub key: ReadingKey,
    pub sensor_id: Option<String>,
    pub value: Option<f64>,
    pub quality: Quality,
    pub payload: ReadingPayload,
}

/// Tenant, farm, pen or device selector for aggregation queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farm_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pen_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Scope {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        // ---
        Scope {
            tenant_id: tenant_id.into(),
            farm_id: None,
            pen_id: None,
            device_id: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        // ---
        if self.tenant_id.trim().is_empty() {
            return Err(AnalyticsError::validation("scope.tenant_id is required"));
        }
        Ok(())
    }

    /// True when every component this scope specifies matches the reading.
    pub fn contains(&self, reading: &ClassifiedReading) -> bool {
        // ---
        let matches = |want: &Option<String>, have: Option<&str>| {
            want.as_deref().map_or(true, |w| have == Some(w))
        };
        reading.key.tenant_id == self.tenant_id
            && matches(&self.farm_id, reading.payload.farm_id.as_deref())
            && matches(&self.pen_id, reading.payload.pen_id.as_deref())
            && matches(&self.device_id, Some(reading.key.device_id.as_str()))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |p: &Option<String>| p.clone().unwrap_or_else(|| "*".to_string());
        write!(
            f,
            "{}/{}/{}/{}",
            self.tenant_id,
            part(&self.farm_id),
            part(&self.pen_id),
            part(&self.device_id)
        )
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        DateRange { start, end }
    }

    pub fn validate(&self) -> Result<()> {
        // ---
        if self.end <= self.start {
            return Err(AnalyticsError::validation(format!(
                "date_range end {} must be after start {}",
                self.end, self.start
            )));
        }
        Ok(())
    }

    pub fn length(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    /// The equal-length range immediately before this one.
    pub fn preceding(&self) -> DateRange {
        // ---
        DateRange {
            start: self.start - self.length(),
            end: self.start,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn create_test_request() -> serde_json::Value {
        // ---
        json!({
            "time": "2025-03-26T18:45:00Z",
            "tenant_id": "tenant-1",
            "device_id": "scale-A",
            "metric": "weight",
            "value": 245.5,
            "sensor_id": "  Load Cell 01 ",
            "payload": { "farm_id": "farm-1", "pen_id": "pen-3", "head_count": 50, "vendor": "acme" }
        })
    }

    #[test]
    fn test_parse_valid_request() {
        // ---
        let m = IngestRequest::parse(create_test_request()).unwrap();

        assert_eq!(m.tenant_id, "tenant-1");
        assert_eq!(m.value, Some(245.5));
        assert_eq!(m.time, Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap());
        assert_eq!(m.payload.farm_id.as_deref(), Some("farm-1"));
        assert_eq!(m.payload.head_count, Some(50));
        assert_eq!(m.payload.extensions.get("vendor"), Some(&json!("acme")));
    }

    #[test]
    fn test_missing_identity_fields_are_rejected() {
        // ---
        for field in ["time", "tenant_id", "device_id", "metric"] {
            let mut item = create_test_request();
            item.as_object_mut().unwrap().remove(field);
            let err = IngestRequest::parse(item).unwrap_err();
            assert!(matches!(err, AnalyticsError::Validation(_)), "{field}");
        }

        let mut blank = create_test_request();
        blank["device_id"] = json!("   ");
        assert!(IngestRequest::parse(blank).is_err());
    }

    #[test]
    fn test_non_numeric_value_is_kept_as_absent() {
        // ---
        let mut item = create_test_request();
        item["value"] = json!("heavy");
        assert_eq!(IngestRequest::parse(item).unwrap().value, None);

        let mut item = create_test_request();
        item.as_object_mut().unwrap().remove("value");
        assert_eq!(IngestRequest::parse(item).unwrap().value, None);
    }

    #[test]
    fn test_payload_schema_is_enforced() {
        // ---
        let mut item = create_test_request();
        item["payload"] = json!({ "head_count": "fifty" });
        assert!(IngestRequest::parse(item).is_err());

        let mut item = create_test_request();
        item["payload"] = json!([1, 2, 3]);
        assert!(IngestRequest::parse(item).is_err());

        let mut item = create_test_request();
        item["payload"] = json!({ "feed_consumed": -3.0 });
        assert!(IngestRequest::parse(item).is_err());
    }

    #[test]
    fn test_sensor_id_normalization() {
        // ---
        assert_eq!(normalize_sensor_id(Some("  Load Cell 01 ")), "load-cell-01");
        assert_eq!(normalize_sensor_id(Some("LC#7/b")), "lc7b");
        assert_eq!(normalize_sensor_id(Some("   ")), ANONYMOUS_SENSOR);
        assert_eq!(normalize_sensor_id(Some("???")), ANONYMOUS_SENSOR);
        assert_eq!(normalize_sensor_id(None), ANONYMOUS_SENSOR);
        // Stable across calls and spelling variants.
        assert_eq!(
            normalize_sensor_id(Some("Load  Cell\t01")),
            normalize_sensor_id(Some("load cell 01"))
        );
    }

    #[test]
    fn test_quality_literals_round_trip() {
        // ---
        for q in Quality::ALL {
            assert_eq!(q.as_str().parse::<Quality>().unwrap(), q);
            assert_eq!(serde_json::to_value(q).unwrap(), json!(q.as_str()));
        }
        assert!("good".parse::<Quality>().is_err());
    }

    #[test]
    fn test_scope_matching() {
        // ---
        let reading = IngestRequest::parse(create_test_request())
            .unwrap()
            .into_classified(Quality::Clean);

        let mut scope = Scope::tenant("tenant-1");
        assert!(scope.contains(&reading));

        scope.farm_id = Some("farm-1".into());
        scope.pen_id = Some("pen-3".into());
        assert!(scope.contains(&reading));

        scope.pen_id = Some("pen-4".into());
        assert!(!scope.contains(&reading));

        let other_tenant = Scope::tenant("tenant-2");
        assert!(!other_tenant.contains(&reading));
        assert_eq!(scope.to_string(), "tenant-1/farm-1/pen-4/*");
    }

    #[test]
    fn test_date_range_preceding() {
        // ---
        let range = DateRange::new(
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
        );
        let prev = range.preceding();
        assert_eq!(prev.end, range.start);
        assert_eq!(prev.length(), range.length());
        assert!(DateRange::new(range.end, range.start).validate().is_err());
    }
}
