//! Query endpoints over stored readings: aggregates, trends, comparisons, alerts.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use tracing::{debug, info};

use crate::{
    AggregateQuery, AlertQuery, Analytics, AnalyticsError, ComparisonQuery, TrendBatchQuery,
    TrendQuery,
};

// ---

pub fn router() -> Router<Analytics> {
    // ---
    Router::new()
        .route("/aggregates", post(aggregates))
        .route("/trends", post(trends))
        .route("/trends/batch", post(trends_batch))
        .route("/comparisons", post(comparisons))
        .route("/alerts", post(alerts))
}

async fn aggregates(
    State(analytics): State<Analytics>,
    Json(query): Json<AggregateQuery>,
) -> Result<impl IntoResponse, AnalyticsError> {
    // ---
    debug!("POST /aggregates - {} '{}'", query.scope, query.metric);
    let windows = analytics.aggregate(&query).await?;
    Ok((StatusCode::OK, Json(windows)))
}

async fn trends(
    State(analytics): State<Analytics>,
    Json(query): Json<TrendQuery>,
) -> Result<impl IntoResponse, AnalyticsError> {
    // ---
    debug!("POST /trends - {} '{}'", query.scope, query.metric);
    let trend = analytics.trend(&query).await?;
    Ok((StatusCode::OK, Json(trend)))
}

async fn trends_batch(
    State(analytics): State<Analytics>,
    Json(query): Json<TrendBatchQuery>,
) -> Result<impl IntoResponse, AnalyticsError> {
    // ---
    info!("POST /trends/batch - {} scopes", query.scopes.len());
    let outcomes = analytics.trends_batch(query).await?;
    Ok((StatusCode::OK, Json(outcomes)))
}

async fn comparisons(
    State(analytics): State<Analytics>,
    Json(query): Json<ComparisonQuery>,
) -> Result<impl IntoResponse, AnalyticsError> {
    // ---
    debug!("POST /comparisons - {} '{}'", query.scope, query.metric);
    let comparison = analytics.compare(&query).await?;
    Ok((StatusCode::OK, Json(comparison)))
}

async fn alerts(
    State(analytics): State<Analytics>,
    Json(query): Json<AlertQuery>,
) -> Result<impl IntoResponse, AnalyticsError> {
    // ---
    debug!("POST /alerts - {}", query.scope);
    let report = analytics.alerts(&query).await?;
    Ok((StatusCode::OK, Json(report)))
}
