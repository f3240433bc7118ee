//! Sharded in-memory reading store.
//!
//! Records are spread over a fixed number of shards by hash of the identity
//! tuple, each shard behind its own `RwLock`. A conditional write holds only
//! its shard's write lock, so writers of different keys rarely contend and
//! writers of the same key are serialized.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use parking_lot::{Mutex, RwLock};

use super::{CalibrationFlag, DeadLetter, WriteOutcome, ALL_SENSORS};
use crate::classifier::{ConflictPolicy, StoredValue};
use crate::models::{ClassifiedReading, DateRange, Quality, ReadingKey, Scope};

// ---

/// Dead letters retained in memory before the oldest are dropped.
const DEAD_LETTER_CAPACITY: usize = 10_000;

type CalibrationKey = (String, String, String, String);

pub struct MemoryStore {
    shards: Vec<RwLock<HashMap<ReadingKey, ClassifiedReading>>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    calibrations: RwLock<HashSet<CalibrationKey>>,
}

impl MemoryStore {
    pub fn new(shards: usize) -> Self {
        // ---
        MemoryStore {
            shards: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            dead_letters: Mutex::new(VecDeque::new()),
            calibrations: RwLock::new(HashSet::new()),
        }
    }

    fn shard(&self, key: &ReadingKey) -> &RwLock<HashMap<ReadingKey, ClassifiedReading>> {
        // ---
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    pub fn stored_value(&self, key: &ReadingKey) -> Option<StoredValue> {
        self.shard(key).read().get(key).map(|r| StoredValue(r.value))
    }

    pub fn is_calibrating(&self, key: &ReadingKey) -> bool {
        // ---
        let flags = self.calibrations.read();
        [key.sensor_id_norm.as_str(), ALL_SENSORS].into_iter().any(|sensor| {
            flags.contains(&(
                key.tenant_id.clone(),
                key.device_id.clone(),
                key.metric.clone(),
                sensor.to_string(),
            ))
        })
    }

    pub fn write(&self, reading: &ClassifiedReading, policy: ConflictPolicy) -> WriteOutcome {
        // ---
        let mut shard = self.shard(&reading.key).write();
        let Some(stored) = shard.get_mut(&reading.key) else {
            shard.insert(reading.key.clone(), reading.clone());
            return WriteOutcome::Inserted;
        };

        if stored.value == reading.value {
            return WriteOutcome::Duplicate {
                stored: stored.quality,
            };
        }
        match policy {
            ConflictPolicy::LastWriteWins => {
                let previous = stored.value;
                *stored = reading.clone();
                WriteOutcome::Superseded { previous }
            }
            ConflictPolicy::Reject => WriteOutcome::Rejected {
                existing: stored.value,
            },
        }
    }

    pub fn dead_letter(&self, letter: DeadLetter) {
        // ---
        let mut sink = self.dead_letters.lock();
        if sink.len() == DEAD_LETTER_CAPACITY {
            sink.pop_front();
        }
        sink.push_back(letter);
    }

    pub fn dead_letters(&self, limit: usize) -> Vec<DeadLetter> {
        self.dead_letters.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn readings(&self, scope: &Scope, metric: &str, range: &DateRange) -> Vec<ClassifiedReading> {
        // ---
        let mut out: Vec<ClassifiedReading> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .values()
                    .filter(|r| r.key.metric == metric && range.contains(r.key.time) && scope.contains(r))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| a.key.time.cmp(&b.key.time));
        out
    }

    pub fn revise_quality(&self, key: &ReadingKey, quality: Quality) -> Option<ClassifiedReading> {
        // ---
        let mut shard = self.shard(key).write();
        let stored = shard.get_mut(key)?;
        stored.quality = quality;
        Some(stored.clone())
    }

    pub fn set_calibration(&self, flag: &CalibrationFlag) {
        self.calibrations.write().insert(calibration_key(flag));
    }

    pub fn clear_calibration(&self, flag: &CalibrationFlag) -> bool {
        self.calibrations.write().remove(&calibration_key(flag))
    }
}

fn calibration_key(flag: &CalibrationFlag) -> CalibrationKey {
    // ---
    (
        flag.tenant_id.clone(),
        flag.device_id.clone(),
        flag.metric.clone(),
        flag.sensor_key(),
    )
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::classifier::DlqReason;
    use crate::models::{RawMeasurement, ReadingPayload};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap()
    }

    fn reading(value: f64, sensor: &str, offset_hours: i64) -> ClassifiedReading {
        // ---
        RawMeasurement {
            time: t0() + Duration::hours(offset_hours),
            tenant_id: "tenant-1".into(),
            device_id: "scale-A".into(),
            metric: "weight".into(),
            sensor_id: Some(sensor.into()),
            value: Some(value),
            payload: ReadingPayload::default(),
        }
        .into_classified(Quality::Clean)
    }

    #[test]
    fn test_write_outcomes() {
        // ---
        let store = MemoryStore::new(4);
        let first = reading(250.0, "cell-1", 0);

        assert_eq!(store.write(&first, ConflictPolicy::Reject), WriteOutcome::Inserted);
        assert_eq!(
            store.write(&first, ConflictPolicy::Reject),
            WriteOutcome::Duplicate { stored: Quality::Clean }
        );

        // Same value, different tag: the stored record keeps its quality.
        let mut late = first.clone();
        late.quality = Quality::Stale;
        assert_eq!(
            store.write(&late, ConflictPolicy::LastWriteWins),
            WriteOutcome::Duplicate { stored: Quality::Clean }
        );

        // Spelling variant of the same sensor lands on the same key.
        let variant = reading(260.0, " CELL 1 ", 0);
        assert_eq!(variant.key, first.key);
        assert_eq!(
            store.write(&variant, ConflictPolicy::Reject),
            WriteOutcome::Rejected { existing: Some(250.0) }
        );
        assert_eq!(store.stored_value(&first.key), Some(StoredValue(Some(250.0))));

        assert_eq!(
            store.write(&variant, ConflictPolicy::LastWriteWins),
            WriteOutcome::Superseded { previous: Some(250.0) }
        );
        assert_eq!(store.stored_value(&first.key), Some(StoredValue(Some(260.0))));
    }

    #[test]
    fn test_concurrent_writers_of_one_key_insert_once() {
        // ---
        let store = Arc::new(MemoryStore::new(16));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.write(&reading(200.0 + i as f64, "cell-1", 0), ConflictPolicy::Reject))
            })
            .collect();

        let outcomes: Vec<WriteOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let inserted = outcomes.iter().filter(|o| **o == WriteOutcome::Inserted).count();
        assert_eq!(inserted, 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, WriteOutcome::Rejected { .. }))
                .count(),
            7
        );
    }

    #[test]
    fn test_readings_are_filtered_and_ordered() {
        // ---
        let store = MemoryStore::new(8);
        for h in [5, 1, 3] {
            store.write(&reading(200.0 + h as f64, "cell-1", h), ConflictPolicy::Reject);
        }
        let mut other = reading(999.0, "cell-1", 2);
        other.key.tenant_id = "tenant-2".into();
        store.write(&other, ConflictPolicy::Reject);

        let range = DateRange::new(t0(), t0() + Duration::hours(4));
        let got = store.readings(&Scope::tenant("tenant-1"), "weight", &range);
        let values: Vec<_> = got.iter().map(|r| r.value.unwrap()).collect();
        assert_eq!(values, vec![201.0, 203.0]);
    }

    #[test]
    fn test_calibration_flags() {
        // ---
        let store = MemoryStore::new(2);
        let key = reading(1.0, "cell-1", 0).key;
        let device_wide = CalibrationFlag {
            tenant_id: "tenant-1".into(),
            device_id: "scale-A".into(),
            metric: "weight".into(),
            sensor_id: None,
        };
        assert!(!store.is_calibrating(&key));

        store.set_calibration(&device_wide);
        assert!(store.is_calibrating(&key));
        assert!(store.clear_calibration(&device_wide));
        assert!(!store.clear_calibration(&device_wide));

        let one_sensor = CalibrationFlag {
            sensor_id: Some("Cell 1".into()),
            ..device_wide
        };
        store.set_calibration(&one_sensor);
        assert!(store.is_calibrating(&key));
        assert!(!store.is_calibrating(&reading(1.0, "cell-2", 0).key));
    }

    #[test]
    fn test_revise_quality_and_dead_letters() {
        // ---
        let store = MemoryStore::new(2);
        let r = reading(250.0, "cell-1", 0);
        store.write(&r, ConflictPolicy::LastWriteWins);

        let revised = store.revise_quality(&r.key, Quality::Anomaly).unwrap();
        assert_eq!(revised.quality, Quality::Anomaly);
        assert_eq!(revised.key, r.key);
        assert!(store.revise_quality(&reading(1.0, "cell-9", 0).key, Quality::Clean).is_none());

        store.dead_letter(DeadLetter::new(DlqReason::Conflict, r.clone(), t0()));
        store.dead_letter(DeadLetter::new(DlqReason::LookupTimeout, r, t0()));
        let letters = store.dead_letters(10);
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].reason, DlqReason::LookupTimeout);
        assert_eq!(letters[0].reading.quality, Quality::Dlq);
        assert_eq!(store.dead_letters(1).len(), 1);
    }
}
