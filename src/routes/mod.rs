//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds every HTTP endpoint under a single Axum router. All
//! routes speak JSON except the two photo uploads, which take multipart
//! bodies and carry their own request size limit.

pub mod actor;
pub mod analysis;
pub mod analytics;
pub mod directory;
pub mod issues;

use axum::Router;
use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart};
use axum::handler::Handler;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::ApiError;
use crate::rate_limit::RateLimitError;
use crate::services::upload::UploadError;
use crate::state::AppState;

/// Room for multipart boundaries and the other form fields on top of the
/// photo itself.
const UPLOAD_BODY_SLACK: usize = 64 * 1024;

/// Full API router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let upload_limit = state.uploads.max_bytes.saturating_add(UPLOAD_BODY_SLACK);

    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/api/ai/analyse-image",
            post(
                analysis::analyse_image
                    .layer(DefaultBodyLimit::disable())
                    .layer(RequestBodyLimitLayer::new(upload_limit)),
            ),
        )
        .route("/api/sectors", get(directory::list_sectors).post(directory::create_sector))
        .route("/api/users", get(directory::list_users).post(directory::create_user))
        .route("/api/users/{id}", get(directory::get_user))
        .route("/api/technicians", get(directory::list_technicians))
        .route("/api/issues", get(issues::list_issues).post(issues::create_issue))
        .route("/api/issues/{id}", get(issues::get_issue))
        .route(
            "/api/issues/{id}/images",
            get(issues::list_images).post(
                issues::upload_image
                    .layer(DefaultBodyLimit::disable())
                    .layer(RequestBodyLimitLayer::new(upload_limit)),
            ),
        )
        .route("/api/issues/{id}/actions", get(issues::allowed_actions).post(issues::apply_action))
        .route("/api/issues/{id}/events", get(issues::list_events))
        .route("/api/analytics/summary", get(analytics::summary))
        .route("/api/analytics/leaderboard", get(analytics::leaderboard))
        .route("/api/analytics/queues", get(analytics::queues))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

// =============================================================================
// SHARED HELPERS
// =============================================================================

pub(crate) fn rate_limited(err: &RateLimitError) -> ApiError {
    warn!(error = %err, "rate limited");
    ApiError::from_code(StatusCode::TOO_MANY_REQUESTS, err)
}

pub(crate) fn upload_error_to_status(err: &UploadError) -> StatusCode {
    match err {
        UploadError::Empty => StatusCode::BAD_REQUEST,
        UploadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        UploadError::UnsupportedType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        UploadError::NameExhausted | UploadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn upload_error(err: &UploadError) -> ApiError {
    ApiError::from_code(upload_error_to_status(err), err)
}

/// The `image` part of a multipart upload.
pub(crate) struct ImageField {
    pub filename: String,
    pub bytes: Bytes,
}

/// Pull the `image` field out of a multipart body. Other fields are skipped.
///
/// # Errors
///
/// Malformed multipart bodies and bodies over the route's size limit map to
/// the status axum reports for them (400 / 413).
pub(crate) async fn read_image_field(mut multipart: Multipart) -> Result<Option<ImageField>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("image") {
            continue;
        }
        let filename = field.file_name().unwrap_or("image").to_owned();
        let bytes = field.bytes().await.map_err(multipart_error)?;
        return Ok(Some(ImageField { filename, bytes }));
    }
    Ok(None)
}

fn multipart_error(err: MultipartError) -> ApiError {
    ApiError::new(err.status(), "E_MULTIPART", err.body_text())
}


#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
