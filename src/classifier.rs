//! Reading classifier: assigns a quality tag to every well-formed measurement.
//!
//! Rules run in a fixed order and the first match wins:
//!
//! 1. value absent or non-numeric      -> `invalid`
//! 2. value outside the plausible range -> `anomaly`
//! 3. older than the staleness horizon  -> `stale`
//! 4. device/sensor mid-calibration     -> `calibrating`
//! 5. identity already stored with a different value -> conflict policy
//! 6. otherwise                         -> `clean`
//!
//! Rules 1-3 only look at the measurement itself ([`Classifier::screen`]).
//! Rules 4-5 depend on store lookups that the caller performs under a timeout
//! and hands in as [`Lookups`]; a lookup that timed out or failed resolves to
//! `dlq` instead of stalling the batch.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::MetricCatalog;
use crate::errors::AnalyticsError;
use crate::models::{Quality, RawMeasurement};

// ---

/// What to do when an identity tuple is written twice with different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The newer write supersedes the stored record.
    LastWriteWins,
    /// The newer write is diverted to the dead-letter sink.
    Reject,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::LastWriteWins => f.write_str("last_write_wins"),
            ConflictPolicy::Reject => f.write_str("reject"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s.trim().to_ascii_lowercase().as_str() {
            "last_write_wins" | "lww" => Ok(ConflictPolicy::LastWriteWins),
            "reject" => Ok(ConflictPolicy::Reject),
            other => Err(AnalyticsError::validation(format!(
                "unknown conflict policy '{other}' (expected last_write_wins or reject)"
            ))),
        }
    }
}

/// Why a reading ended up in the dead-letter sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    Conflict,
    LookupTimeout,
    StoreError,
}

impl DlqReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DlqReason::Conflict => "conflict",
            DlqReason::LookupTimeout => "lookup_timeout",
            DlqReason::StoreError => "store_error",
        }
    }
}

impl FromStr for DlqReason {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        [DlqReason::Conflict, DlqReason::LookupTimeout, DlqReason::StoreError]
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| AnalyticsError::validation(format!("unknown dlq reason '{s}'")))
    }
}

/// Result of a store lookup performed on behalf of the classifier.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    TimedOut,
    Failed(String),
}

/// Value currently stored under an identity tuple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredValue(pub Option<f64>);

#[derive(Debug, Clone, PartialEq)]
pub struct Lookups {
    pub calibrating: Lookup<bool>,
    pub existing: Lookup<Option<StoredValue>>,
}

/// Duplicate-identity write that did not match the stored value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub policy: ConflictPolicy,
    pub existing_value: Option<f64>,
    pub incoming_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub quality: Quality,
    pub dlq_reason: Option<DlqReason>,
    pub conflict: Option<Conflict>,
    /// Set when a last-write-wins conflict replaces a stored record.
    pub supersedes: bool,
}

impl Verdict {
    pub fn tagged(quality: Quality) -> Self {
        // ---
        Verdict {
            quality,
            dlq_reason: None,
            conflict: None,
            supersedes: false,
        }
    }

    pub fn dead_letter(reason: DlqReason) -> Self {
        // ---
        Verdict {
            quality: Quality::Dlq,
            dlq_reason: Some(reason),
            conflict: None,
            supersedes: false,
        }
    }

    fn from_failed_lookup<T>(lookup: &Lookup<T>, what: &str) -> Option<Self> {
        // ---
        match lookup {
            Lookup::Found(_) => None,
            Lookup::TimedOut => {
                tracing::warn!("{what} lookup timed out, routing reading to dlq");
                Some(Verdict::dead_letter(DlqReason::LookupTimeout))
            }
            Lookup::Failed(e) => {
                tracing::warn!("{what} lookup failed ({e}), routing reading to dlq");
                Some(Verdict::dead_letter(DlqReason::StoreError))
            }
        }
    }
}

/// Stateless rule evaluator; cheap to build per request.
#[derive(Debug, Clone, Copy)]
pub struct Classifier<'a> {
    catalog: &'a MetricCatalog,
    stale_after: Duration,
    policy: ConflictPolicy,
}

impl<'a> Classifier<'a> {
    pub fn new(catalog: &'a MetricCatalog, stale_after: Duration, policy: ConflictPolicy) -> Self {
        Classifier {
            catalog,
            stale_after,
            policy,
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Rules 1-3. `None` means the reading needs the store-backed rules.
    pub fn screen(&self, m: &RawMeasurement, now: DateTime<Utc>) -> Option<Quality> {
        // ---
        let Some(value) = m.value else {
            return Some(Quality::Invalid);
        };
        let plausible = self
            .catalog
            .get(&m.metric)
            .map_or(true, |spec| spec.is_plausible(value));
        if !plausible {
            return Some(Quality::Anomaly);
        }
        if now - m.time > self.stale_after {
            return Some(Quality::Stale);
        }
        None
    }

    /// Rules 4-6, given the outcome of the store lookups.
    pub fn resolve(&self, m: &RawMeasurement, lookups: &Lookups) -> Verdict {
        // ---
        if let Some(v) = Verdict::from_failed_lookup(&lookups.calibrating, "calibration") {
            return v;
        }
        if lookups.calibrating == Lookup::Found(true) {
            return Verdict::tagged(Quality::Calibrating);
        }

        if let Some(v) = Verdict::from_failed_lookup(&lookups.existing, "existing record") {
            return v;
        }
        match &lookups.existing {
            Lookup::Found(Some(StoredValue(existing))) if *existing != m.value => {
                let conflict = Conflict {
                    policy: self.policy,
                    existing_value: *existing,
                    incoming_value: m.value,
                };
                match self.policy {
                    ConflictPolicy::LastWriteWins => Verdict {
                        quality: Quality::Clean,
                        dlq_reason: None,
                        conflict: Some(conflict),
                        supersedes: true,
                    },
                    ConflictPolicy::Reject => Verdict {
                        quality: Quality::Dlq,
                        dlq_reason: Some(DlqReason::Conflict),
                        conflict: Some(conflict),
                        supersedes: false,
                    },
                }
            }
            _ => Verdict::tagged(Quality::Clean),
        }
    }

    /// All six rules in order.
    pub fn classify(&self, m: &RawMeasurement, now: DateTime<Utc>, lookups: &Lookups) -> Verdict {
        // ---
        match self.screen(m, now) {
            Some(quality) => Verdict::tagged(quality),
            None => self.resolve(m, lookups),
        }
    }
}
