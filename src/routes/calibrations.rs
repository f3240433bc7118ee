//! Calibration flags: readings from a flagged device or sensor classify as `calibrating`.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use serde_json::json;

use crate::{Analytics, AnalyticsError, CalibrationFlag};

// ---

pub fn router() -> Router<Analytics> {
    // ---
    Router::new().route("/calibrations", post(set_flag).delete(clear_flag))
}

async fn set_flag(
    State(analytics): State<Analytics>,
    Json(flag): Json<CalibrationFlag>,
) -> Result<impl IntoResponse, AnalyticsError> {
    // ---
    analytics.set_calibration(&flag).await?;
    Ok((StatusCode::OK, Json(json!({ "calibrating": true, "flag": flag }))))
}

async fn clear_flag(
    State(analytics): State<Analytics>,
    Json(flag): Json<CalibrationFlag>,
) -> Result<impl IntoResponse, AnalyticsError> {
    // ---
    let cleared = analytics.clear_calibration(&flag).await?;
    Ok((StatusCode::OK, Json(json!({ "calibrating": false, "cleared": cleared, "flag": flag }))))
}
