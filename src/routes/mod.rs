//! Route gateway: merges the sibling subrouters and binds the shared state.
//!
//! Also the one place where domain errors become HTTP responses.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json, Router};
use serde_json::json;

use crate::{AnalyticsError, Analytics};

mod analytics;
mod calibrations;
mod health;
mod readings;

// ---

pub fn router(state: Analytics) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(analytics::router())
        .merge(calibrations::router())
        .merge(health::router())
        .with_state(state)
}

impl IntoResponse for AnalyticsError {
    fn into_response(self) -> Response {
        // ---
        let (status, code) = match &self {
            AnalyticsError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            AnalyticsError::NoReadings { .. } => (StatusCode::NOT_FOUND, "no_readings"),
            AnalyticsError::UnknownReading(_) => (StatusCode::NOT_FOUND, "unknown_reading"),
            AnalyticsError::Database(_) | AnalyticsError::Task(_) => {
                tracing::error!("Request failed: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };
        (status, Json(json!({ "error": code, "message": self.to_string() }))).into_response()
    }
}
