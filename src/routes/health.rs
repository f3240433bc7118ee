// src/routes/health.rs
//! API health check endpoint for the growth analytics service.
//!
//! This module defines the `/health` route used by container orchestrators
//! and CI pipelines to verify that the service is running and able to respond
//! to HTTP requests. It is a sibling module in the `routes` directory and
//! follows the Explicit Module Boundary Pattern (EMBP):
//! - Internal to this file: endpoint handler(s) and related types
//! - Exports to the gateway (`mod.rs`): a subrouter containing the `/health` route

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::Analytics;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
    conflict_policy: String,
}

/// Handle `GET /health`.
///
/// Reports which store backend and conflict policy are active. Does not touch
/// the database.
async fn health(State(analytics): State<Analytics>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        store: analytics.store().backend(),
        conflict_policy: analytics.config().conflict_policy.to_string(),
    })
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<Analytics> {
    Router::new().route("/health", get(health))
}
