//! Domain error taxonomy for the analytics core.
//!
//! Classification never fails (the worst case is a `dlq` tag) and degenerate
//! arithmetic is reported through warning codes on the results, so the only
//! errors that cross a module boundary are the ones below.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyticsError {
    /// Malformed ingestion payload or query, rejected before any stage runs.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A trend was requested over a range without a single non-empty window.
    #[error("no readings for scope {scope} metric '{metric}' in the requested range")]
    NoReadings { scope: String, metric: String },

    /// Quality revision addressed an identity tuple that is not stored.
    #[error("no stored reading for {0}")]
    UnknownReading(String),

    #[error("database operation failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("background computation failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AnalyticsError {
    // ---
    pub fn validation(msg: impl Into<String>) -> Self {
        AnalyticsError::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;
