//! Issue routes: submission, queries, photos and workflow actions.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::routes::actor::CurrentUser;
use crate::routes::{rate_limited, read_image_field, upload_error};
use crate::services::analysis_worker::enqueue_analysis;
use crate::services::issue::{self, Category, Issue, IssueError, IssueEvent, IssueFilter, IssueImage, NewIssue, Priority};
use crate::services::upload;
use crate::state::AppState;
use crate::workflow::{Action, ActionKind, IssueStatus, Role, WorkflowError};

pub(crate) fn issue_error_to_status(err: &IssueError) -> StatusCode {
    match err {
        IssueError::NotFound(_) => StatusCode::NOT_FOUND,
        IssueError::Validation(_) | IssueError::SectorNotFound(_) | IssueError::NotATechnician(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        IssueError::VersionConflict { .. } => StatusCode::CONFLICT,
        IssueError::Workflow(WorkflowError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        IssueError::Workflow(WorkflowError::Forbidden { .. }) => StatusCode::FORBIDDEN,
        IssueError::Workflow(WorkflowError::MissingField { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        IssueError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn issue_error(err: IssueError) -> ApiError {
    ApiError::from_code(issue_error_to_status(&err), &err)
}

// =============================================================================
// SUBMISSION / QUERIES
// =============================================================================

/// `POST /api/issues`: submit a new issue as the calling user.
pub async fn create_issue(
    State(state): State<AppState>,
    caller: CurrentUser,
    Json(body): Json<NewIssue>,
) -> Result<(StatusCode, Json<Issue>), ApiError> {
    state
        .rate_limiter
        .check_submission(caller.user.id)
        .map_err(|e| rate_limited(&e))?;
    let issue = issue::create_issue(&state.pool, caller.reporter(), &body)
        .await
        .map_err(issue_error)?;
    Ok((StatusCode::CREATED, Json(issue)))
}

#[derive(Debug, Default, Deserialize)]
pub struct IssueQuery {
    pub status: Option<String>,
    pub sector_id: Option<Uuid>,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub guest: Option<bool>,
    pub reporter_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub q: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn parse_param<T>(raw: Option<&str>, name: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(value) => parse(value)
            .map(Some)
            .ok_or_else(|| ApiError::bad_request(format!("unknown {name}: {value}"))),
    }
}

fn issue_filter(query: IssueQuery) -> Result<IssueFilter, ApiError> {
    Ok(IssueFilter {
        status: parse_param(query.status.as_deref(), "status", IssueStatus::parse)?,
        sector_id: query.sector_id,
        category: parse_param(query.category.as_deref(), "category", Category::parse)?,
        priority: parse_param(query.priority.as_deref(), "priority", Priority::parse)?,
        is_guest_report: query.guest,
        reporter_id: query.reporter_id,
        assignee_id: query.assignee_id,
        query: query.q,
        limit: query.limit,
        offset: query.offset,
    })
}

/// `GET /api/issues`: filtered, paged list, newest first.
pub async fn list_issues(
    State(state): State<AppState>,
    Query(query): Query<IssueQuery>,
) -> Result<Json<Vec<Issue>>, ApiError> {
    let filter = issue_filter(query)?;
    let issues = issue::list_issues(&state.pool, &filter).await.map_err(issue_error)?;
    Ok(Json(issues))
}

#[derive(Debug, Serialize)]
pub struct IssueDetail {
    #[serde(flatten)]
    pub issue: Issue,
    pub images: Vec<IssueImage>,
}

/// `GET /api/issues/{id}`
pub async fn get_issue(State(state): State<AppState>, Path(issue_id): Path<Uuid>) -> Result<Json<IssueDetail>, ApiError> {
    let issue = issue::get_issue(&state.pool, issue_id).await.map_err(issue_error)?;
    let images = issue::list_images(&state.pool, issue_id).await.map_err(issue_error)?;
    Ok(Json(IssueDetail { issue, images }))
}

/// `GET /api/issues/{id}/events`: audit trail, oldest first.
pub async fn list_events(
    State(state): State<AppState>,
    Path(issue_id): Path<Uuid>,
) -> Result<Json<Vec<IssueEvent>>, ApiError> {
    let events = issue::list_events(&state.pool, issue_id).await.map_err(issue_error)?;
    Ok(Json(events))
}

// =============================================================================
// PHOTOS
// =============================================================================

/// `GET /api/issues/{id}/images`
pub async fn list_images(
    State(state): State<AppState>,
    Path(issue_id): Path<Uuid>,
) -> Result<Json<Vec<IssueImage>>, ApiError> {
    issue::get_issue(&state.pool, issue_id).await.map_err(issue_error)?;
    let images = issue::list_images(&state.pool, issue_id).await.map_err(issue_error)?;
    Ok(Json(images))
}

/// Reporters attach photos to their own issues; staff to any issue.
fn may_attach(caller: &CurrentUser, issue: &Issue) -> Result<(), ApiError> {
    if caller.user.role != Role::Citizen || caller.user.id == issue.reporter_id {
        Ok(())
    } else {
        Err(ApiError::new(StatusCode::FORBIDDEN, "E_FORBIDDEN", "only the reporter may attach photos"))
    }
}

/// Other issues carrying the same photo. The photo is already attached, so a
/// failed lookup only loses the hint.
async fn duplicate_refs(pool: &PgPool, issue_id: Uuid, sha256: &str) -> Vec<String> {
    match issue::find_duplicate_images(pool, issue_id, sha256).await {
        Ok(refs) => {
            if !refs.is_empty() {
                info!(%issue_id, duplicates = ?refs, "photo already attached elsewhere");
            }
            refs
        }
        Err(e) => {
            warn!(%issue_id, error = %e, "duplicate photo lookup failed");
            Vec::new()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub image: IssueImage,
    /// References of other issues carrying the same photo.
    pub duplicate_of: Vec<String>,
    /// Whether the issue was queued for analysis.
    pub queued: bool,
}

/// `POST /api/issues/{id}/images`: multipart field `image`.
///
/// The first photo on a `submitted` issue queues it for analysis.
pub async fn upload_image(
    State(state): State<AppState>,
    caller: CurrentUser,
    Path(issue_id): Path<Uuid>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let current = issue::get_issue(&state.pool, issue_id).await.map_err(issue_error)?;
    may_attach(&caller, &current)?;

    let Some(field) = read_image_field(multipart).await? else {
        return Err(ApiError::bad_request("No image provided"));
    };
    let stored = upload::store_image(&state.uploads, &field.filename, &field.bytes)
        .await
        .map_err(|e| upload_error(&e))?;

    let image = match issue::attach_image(&state.pool, issue_id, &stored).await {
        Ok(image) => image,
        Err(e) => {
            if let Err(io) = tokio::fs::remove_file(&stored.path).await {
                warn!(path = %stored.path.display(), error = %io, "could not remove orphaned upload");
            }
            return Err(issue_error(e));
        }
    };

    let duplicate_of = duplicate_refs(&state.pool, issue_id, &stored.sha256).await;

    let queued = current.status == IssueStatus::Submitted && enqueue_analysis(state.analysis_tx.as_ref(), issue_id);
    Ok((StatusCode::CREATED, Json(UploadResponse { image, duplicate_of, queued })))
}

// =============================================================================
// WORKFLOW
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    #[serde(flatten)]
    pub action: Action,
    /// Version the client last saw. A mismatch is rejected with 409.
    #[serde(default)]
    pub expected_version: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub issue: Issue,
    pub event: IssueEvent,
}

/// `POST /api/issues/{id}/actions`
pub async fn apply_action(
    State(state): State<AppState>,
    caller: CurrentUser,
    Path(issue_id): Path<Uuid>,
    Json(body): Json<ActionRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let (issue, event) = issue::apply_action(&state.pool, issue_id, &caller.actor(), &body.action, body.expected_version)
        .await
        .map_err(issue_error)?;
    Ok(Json(ActionResponse { issue, event }))
}

#[derive(Debug, Serialize)]
pub struct AllowedActions {
    pub status: IssueStatus,
    pub version: i32,
    pub actions: Vec<ActionKind>,
}

/// `GET /api/issues/{id}/actions`: what the caller could do next.
pub async fn allowed_actions(
    State(state): State<AppState>,
    caller: CurrentUser,
    Path(issue_id): Path<Uuid>,
) -> Result<Json<AllowedActions>, ApiError> {
    let issue = issue::get_issue(&state.pool, issue_id).await.map_err(issue_error)?;
    let actions = crate::workflow::allowed_actions(&issue.context(), &caller.actor());
    Ok(Json(AllowedActions { status: issue.status, version: issue.version, actions }))
}

#[cfg(test)]
#[path = "issues_test.rs"]
mod tests;
