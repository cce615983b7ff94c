//! Ad-hoc image analysis: `POST /api/ai/analyse-image`.
//!
//! Stores the uploaded photo, runs the configured analyzer synchronously and
//! returns the model's report. The attempt is recorded in `analyses` in the
//! background so a slow database never delays the response.

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use tracing::warn;

use crate::error::{ApiError, ErrorCode};
use crate::routes::{rate_limited, read_image_field, upload_error};
use crate::services::analysis::{self, AnalysisError, AnalysisReport};
use crate::services::upload;
use crate::state::AppState;

pub(crate) fn analysis_error_to_status(err: &AnalysisError) -> StatusCode {
    match err {
        AnalysisError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Body for a failed analysis. Details carry the analyzer's own message.
pub(crate) fn analysis_failure(err: &AnalysisError) -> Response {
    let body = json!({
        "error": "Failed to analyze image",
        "details": err.to_string(),
        "code": err.error_code(),
    });
    (analysis_error_to_status(err), Json(body)).into_response()
}

fn analysis_success(report: &AnalysisReport, filename: &str, model_version: &str) -> serde_json::Value {
    json!({
        "success": true,
        "analysis": report,
        "filename": filename,
        "model_version": model_version,
    })
}

/// `POST /api/ai/analyse-image`: multipart field `image`.
pub async fn analyse_image(State(state): State<AppState>, multipart: Multipart) -> Result<Response, ApiError> {
    let Some(field) = read_image_field(multipart).await? else {
        return Err(ApiError::bad_request("No image provided"));
    };
    upload::validate_image(&state.uploads, &field.bytes).map_err(|e| upload_error(&e))?;
    let Some(analyzer) = state.analyzer.clone() else {
        return Ok(analysis_failure(&AnalysisError::NotConfigured));
    };
    // Only well-formed requests count against the analysis budget.
    state.rate_limiter.check_analysis().map_err(|e| rate_limited(&e))?;

    let stored = upload::store_image(&state.uploads, &field.filename, &field.bytes)
        .await
        .map_err(|e| upload_error(&e))?;

    let (result, elapsed) = analysis::run_timed(analyzer.as_ref(), &stored.path).await;

    let pool = state.pool.clone();
    let model_version = analyzer.model_version().to_owned();
    let response = match &result {
        Ok(report) => Json(analysis_success(report, &stored.stored_name, &model_version)).into_response(),
        Err(e) => analysis_failure(e),
    };
    tokio::spawn(async move {
        if let Err(e) = analysis::record_analysis(&pool, None, None, &result, &model_version, elapsed).await {
            warn!(error = %e, "failed to record ad-hoc analysis");
        }
    });

    Ok(response)
}

#[cfg(test)]
#[path = "analysis_test.rs"]
mod tests;
