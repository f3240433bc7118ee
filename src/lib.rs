//! Growth and performance analytics for farm sensor readings.
//!
//! Readings flow through four stages: the classifier tags every measurement
//! with a quality, the aggregator rolls tagged readings into fixed windows,
//! the trend calculator derives growth figures and projections from those
//! windows, and the comparison and alert stages evaluate trends against each
//! other and against thresholds.
//!
//! Module layout follows the Explicit Module Boundary Pattern (EMBP): the
//! crate root re-exports the types that `routes/*.rs` need, so route modules
//! only ever import from `crate::`.

use anyhow::Result;
use axum::Router;

pub mod aggregator;
pub mod alerts;
pub mod batch;
pub mod catalog;
pub mod classifier;
pub mod comparison;
pub mod config;
pub mod errors;
pub mod models;
pub mod service;
pub mod store;
pub mod trend;

mod routes;
mod schema;

pub use aggregator::{AggregateQuery, AggregateWindow, Inclusion, WindowSize};
pub use alerts::{Alert, AlertType, Severity, Thresholds};
pub use batch::{ScopeOutcome, TrendBatchQuery};
pub use catalog::{MetricCatalog, MetricSpec, MetricUnit};
pub use classifier::{ConflictPolicy, DlqReason};
pub use comparison::{ComparisonQuery, ComparisonResult, Indicator};
pub use config::Config;
pub use errors::AnalyticsError;
pub use models::{ClassifiedReading, DateRange, IngestRequest, Quality, ReadingKey, Scope};
pub use service::{AlertQuery, Analytics, QualityRevision};
pub use store::{CalibrationFlag, DeadLetter, ReadingStore};
pub use trend::{Projection, TrendQuery, TrendResult};

// ---

/// Assemble the HTTP application for a loaded configuration.
///
/// Loads the metric catalog, opens the store the configuration selects and
/// mounts every route through the `routes` gateway.
pub async fn build_app(cfg: Config) -> Result<Router> {
    // ---
    let catalog = match &cfg.metric_catalog_path {
        Some(path) => MetricCatalog::load(path)?,
        None => MetricCatalog::builtin(),
    };
    tracing::info!("Metric catalog ready with {} metrics", catalog.len());

    let store = ReadingStore::connect(&cfg).await?;
    let analytics = Analytics::new(store, catalog, cfg);
    Ok(routes::router(analytics))
}
