//! Ingestion endpoints: single reading, batch, quality revision, dead letters.

use axum::{
    extract::Query, extract::State, http::StatusCode, response::IntoResponse, routing::get,
    routing::post, Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{Analytics, AnalyticsError, IngestRequest, QualityRevision};

// ---

const DEFAULT_DEAD_LETTER_LIMIT: usize = 100;
const MAX_DEAD_LETTER_LIMIT: usize = 1000;

pub fn router() -> Router<Analytics> {
    // ---
    Router::new()
        .route("/readings", post(ingest))
        .route("/readings/batch", post(ingest_batch))
        .route("/readings/quality", post(revise_quality))
        .route("/readings/dead-letters", get(dead_letters))
}

/// `201` with the classified record, or `409` when the reject policy diverted it.
async fn ingest(
    State(analytics): State<Analytics>,
    Json(item): Json<serde_json::Value>,
) -> Result<impl IntoResponse, AnalyticsError> {
    // ---
    debug!("POST /readings");
    let raw = IngestRequest::parse(item)?;
    let result = analytics.ingest(raw, Utc::now()).await;

    let status = if result.is_conflict() {
        StatusCode::CONFLICT
    } else {
        StatusCode::CREATED
    };
    info!(
        "POST /readings - {} classified {}",
        result.reading.key, result.reading.quality
    );
    Ok((status, Json(result)))
}

async fn ingest_batch(
    State(analytics): State<Analytics>,
    Json(items): Json<Vec<serde_json::Value>>,
) -> impl IntoResponse {
    // ---
    info!("POST /readings/batch - {} items", items.len());
    let report = analytics.ingest_batch(items, Utc::now()).await;
    (StatusCode::OK, Json(report))
}

async fn revise_quality(
    State(analytics): State<Analytics>,
    Json(revision): Json<QualityRevision>,
) -> Result<impl IntoResponse, AnalyticsError> {
    // ---
    debug!("POST /readings/quality - {} -> {}", revision.key, revision.quality);
    let revised = analytics.revise_quality(&revision).await?;
    Ok((StatusCode::OK, Json(revised)))
}

#[derive(Debug, Deserialize)]
struct DeadLetterParams {
    limit: Option<usize>,
}

async fn dead_letters(
    State(analytics): State<Analytics>,
    Query(params): Query<DeadLetterParams>,
) -> Result<impl IntoResponse, AnalyticsError> {
    // ---
    let limit = params
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);
    let letters = analytics.dead_letters(limit).await?;
    debug!("GET /readings/dead-letters - returning {}", letters.len());
    Ok((StatusCode::OK, Json(letters)))
}
