//! Metric catalog: per-metric unit, plausible range and distribution buckets.
//!
//! A built-in catalog covers the metrics the farm collaborators emit today.
//! `METRIC_CATALOG_PATH` may point at a JSON object keyed by metric name whose
//! entries replace the built-in ones, e.g.
//!
//! ```json
//! { "weight": { "unit": "grams", "min": 0, "max": 5000, "bucket_edges": [100, 200, 300] } }
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    Grams,
    Kilograms,
    Ratio,
    Percent,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub unit: MetricUnit,
    /// Inclusive lower bound of plausible values.
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive upper bound of plausible values.
    #[serde(default)]
    pub max: Option<f64>,
    /// Ascending interior edges; `n` edges yield `n + 1` buckets.
    #[serde(default)]
    pub bucket_edges: Vec<f64>,
}

impl MetricSpec {
    /// Spec used for metrics the catalog does not know: no range, no buckets.
    pub fn unconstrained() -> Self {
        // ---
        MetricSpec {
            unit: MetricUnit::Other,
            min: None,
            max: None,
            bucket_edges: Vec::new(),
        }
    }

    pub fn is_plausible(&self, value: f64) -> bool {
        // ---
        self.min.map_or(true, |lo| value >= lo) && self.max.map_or(true, |hi| value <= hi)
    }

    /// Total population mass in kilograms, only for mass metrics.
    pub fn biomass(&self, mean: f64, count: usize) -> Option<f64> {
        // ---
        match self.unit {
            MetricUnit::Grams => Some(mean * count as f64 / 1000.0),
            MetricUnit::Kilograms => Some(mean * count as f64),
            MetricUnit::Ratio | MetricUnit::Percent | MetricUnit::Other => None,
        }
    }

    pub fn bucket_labels(&self) -> Vec<String> {
        // ---
        let edges = &self.bucket_edges;
        if edges.is_empty() {
            return Vec::new();
        }
        let mut labels = Vec::with_capacity(edges.len() + 1);
        labels.push(format!("<{}", edges[0]));
        for pair in edges.windows(2) {
            labels.push(format!("{}-{}", pair[0], pair[1]));
        }
        labels.push(format!("{}+", edges[edges.len() - 1]));
        labels
    }

    /// Index into [`bucket_labels`](Self::bucket_labels) for a value.
    pub fn bucket_index(&self, value: f64) -> usize {
        self.bucket_edges.partition_point(|edge| *edge <= value)
    }

    fn check(&self, metric: &str) -> Result<()> {
        // ---
        if let (Some(lo), Some(hi)) = (self.min, self.max) {
            if lo > hi {
                return Err(anyhow!("metric '{metric}': min {lo} exceeds max {hi}"));
            }
        }
        if self.bucket_edges.iter().any(|e| !e.is_finite())
            || self.bucket_edges.windows(2).any(|p| p[0] >= p[1])
        {
            return Err(anyhow!(
                "metric '{metric}': bucket_edges must be finite and strictly ascending"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricCatalog {
    metrics: HashMap<String, MetricSpec>,
}

impl MetricCatalog {
    /// Built-in catalog; weight distribution buckets every 100 g.
    pub fn builtin() -> Self {
        // ---
        let mut metrics = HashMap::new();
        metrics.insert(
            "weight".to_string(),
            MetricSpec {
                unit: MetricUnit::Grams,
                min: Some(0.0),
                max: Some(20_000.0),
                bucket_edges: (1..=10).map(|i| i as f64 * 100.0).collect(),
            },
        );
        metrics.insert(
            "feed_intake".to_string(),
            MetricSpec {
                unit: MetricUnit::Grams,
                min: Some(0.0),
                max: Some(500_000.0),
                bucket_edges: Vec::new(),
            },
        );
        metrics.insert(
            "fcr".to_string(),
            MetricSpec {
                unit: MetricUnit::Ratio,
                min: Some(0.0),
                max: Some(10.0),
                bucket_edges: vec![1.0, 1.2, 1.4, 1.6, 1.8, 2.0],
            },
        );
        metrics.insert(
            "temperature".to_string(),
            MetricSpec {
                unit: MetricUnit::Other,
                min: Some(-20.0),
                max: Some(60.0),
                bucket_edges: Vec::new(),
            },
        );
        metrics.insert(
            "humidity".to_string(),
            MetricSpec {
                unit: MetricUnit::Percent,
                min: Some(0.0),
                max: Some(100.0),
                bucket_edges: Vec::new(),
            },
        );
        MetricCatalog { metrics }
    }

    /// Built-in catalog overlaid with the entries of a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        // ---
        let file = File::open(path)
            .with_context(|| format!("opening metric catalog {}", path.display()))?;
        let overrides: HashMap<String, MetricSpec> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing metric catalog {}", path.display()))?;

        let mut catalog = Self::builtin();
        for (metric, spec) in overrides {
            spec.check(&metric)?;
            catalog.metrics.insert(metric, spec);
        }
        Ok(catalog)
    }

    pub fn get(&self, metric: &str) -> Option<&MetricSpec> {
        self.metrics.get(metric)
    }

    pub fn spec_for(&self, metric: &str) -> MetricSpec {
        // ---
        self.get(metric)
            .cloned()
            .unwrap_or_else(MetricSpec::unconstrained)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::io::Write;

    #[test]
    fn test_weight_buckets() {
        // ---
        let weight = MetricCatalog::builtin().spec_for("weight");
        let labels = weight.bucket_labels();

        assert_eq!(labels.len(), 11);
        assert_eq!(labels[0], "<100");
        assert_eq!(labels[1], "100-200");
        assert_eq!(labels[10], "1000+");

        assert_eq!(weight.bucket_index(50.0), 0);
        assert_eq!(weight.bucket_index(100.0), 1);
        assert_eq!(weight.bucket_index(199.9), 1);
        assert_eq!(weight.bucket_index(5000.0), 10);
    }

    #[test]
    fn test_biomass_depends_on_unit() {
        // ---
        let catalog = MetricCatalog::builtin();
        assert_eq!(catalog.spec_for("weight").biomass(250.0, 200), Some(50.0));
        assert_eq!(catalog.spec_for("fcr").biomass(1.4, 200), None);
        assert_eq!(catalog.spec_for("unknown").biomass(1.0, 1), None);
    }

    #[test]
    fn test_plausible_range() {
        // ---
        let catalog = MetricCatalog::builtin();
        let weight = catalog.spec_for("weight");
        assert!(weight.is_plausible(0.0));
        assert!(weight.is_plausible(20_000.0));
        assert!(!weight.is_plausible(-1.0));
        assert!(!weight.is_plausible(20_000.1));
        assert!(catalog.spec_for("mystery").is_plausible(f64::MAX));
    }

    #[test]
    fn test_load_overrides_builtin() {
        // ---
        let path = std::env::temp_dir().join(format!("catalog-{}.json", uuid::Uuid::new_v4()));
        let mut file = File::create(&path).unwrap();
        write!(
            file,
            r#"{{ "weight": {{ "unit": "kilograms", "max": 5, "bucket_edges": [1, 2] }},
                 "water_ph": {{ "unit": "other", "min": 0, "max": 14 }} }}"#
        )
        .unwrap();

        let catalog = MetricCatalog::load(&path).unwrap();
        assert_eq!(catalog.spec_for("weight").unit, MetricUnit::Kilograms);
        assert_eq!(catalog.spec_for("weight").bucket_labels(), vec!["<1", "1-2", "2+"]);
        assert!(catalog.get("water_ph").is_some());
        assert!(catalog.get("humidity").is_some());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_rejects_unsorted_edges() {
        // ---
        let path = std::env::temp_dir().join(format!("catalog-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{ "weight": { "unit": "grams", "bucket_edges": [200, 100] } }"#)
            .unwrap();
        assert!(MetricCatalog::load(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
