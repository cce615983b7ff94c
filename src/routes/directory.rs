//! Sector, user and technician routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::routes::actor::{CurrentUser, MaybeUser};
use crate::services::directory::{self, DirectoryError, NewSector, NewUser, Sector, Technician, TechnicianFilter, User, UserFilter};
use crate::state::AppState;
use crate::workflow::Role;

pub(crate) fn directory_error_to_status(err: &DirectoryError) -> StatusCode {
    match err {
        DirectoryError::UserNotFound(_) | DirectoryError::SectorNotFound(_) => StatusCode::NOT_FOUND,
        DirectoryError::DuplicateSector(_) => StatusCode::CONFLICT,
        DirectoryError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DirectoryError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn directory_error(err: DirectoryError) -> ApiError {
    ApiError::from_code(directory_error_to_status(&err), &err)
}

// =============================================================================
// SECTORS
// =============================================================================

/// `GET /api/sectors`
pub async fn list_sectors(State(state): State<AppState>) -> Result<Json<Vec<Sector>>, ApiError> {
    let sectors = directory::list_sectors(&state.pool).await.map_err(directory_error)?;
    Ok(Json(sectors))
}

/// `POST /api/sectors`: admin only.
pub async fn create_sector(
    State(state): State<AppState>,
    caller: CurrentUser,
    Json(body): Json<NewSector>,
) -> Result<(StatusCode, Json<Sector>), ApiError> {
    caller.require_admin()?;
    let sector = directory::create_sector(&state.pool, &body).await.map_err(directory_error)?;
    Ok((StatusCode::CREATED, Json(sector)))
}

// =============================================================================
// USERS
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    pub role: Option<String>,
    pub sector_id: Option<Uuid>,
}

fn user_filter(query: UserQuery) -> Result<UserFilter, ApiError> {
    let role = query
        .role
        .as_deref()
        .map(directory::parse_user_role)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(UserFilter { role, sector_id: query.sector_id })
}

/// Anyone may register as a citizen. Every other role needs an admin caller.
fn may_create(caller: Option<&CurrentUser>, requested: &str) -> Result<(), ApiError> {
    let role = directory::parse_user_role(requested).map_err(directory_error)?;
    if role == Role::Citizen {
        return Ok(());
    }
    match caller {
        Some(c) => c.require_admin(),
        None => Err(ApiError::new(StatusCode::UNAUTHORIZED, "E_UNAUTHORIZED", "only admins may create staff accounts")),
    }
}

/// `GET /api/users?role=&sector_id=`
pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<User>>, ApiError> {
    let filter = user_filter(query)?;
    let users = directory::list_users(&state.pool, &filter).await.map_err(directory_error)?;
    Ok(Json(users))
}

/// `POST /api/users`
pub async fn create_user(
    State(state): State<AppState>,
    MaybeUser(caller): MaybeUser,
    Json(body): Json<NewUser>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    may_create(caller.as_ref(), &body.role)?;
    let user = directory::create_user(&state.pool, &body).await.map_err(directory_error)?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// `GET /api/users/{id}`
pub async fn get_user(State(state): State<AppState>, Path(user_id): Path<Uuid>) -> Result<Json<User>, ApiError> {
    let user = directory::get_user(&state.pool, user_id).await.map_err(directory_error)?;
    Ok(Json(user))
}

// =============================================================================
// TECHNICIANS
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TechnicianQuery {
    pub sector_id: Option<Uuid>,
    pub specialization: Option<String>,
    #[serde(default)]
    pub available: bool,
}

/// `GET /api/technicians?sector_id=&specialization=&available=true`
pub async fn list_technicians(
    State(state): State<AppState>,
    Query(query): Query<TechnicianQuery>,
) -> Result<Json<Vec<Technician>>, ApiError> {
    let filter = TechnicianFilter {
        sector_id: query.sector_id,
        specialization: query.specialization,
        available_only: query.available,
    };
    let technicians = directory::list_technicians(&state.pool, &filter, state.technician_max_open)
        .await
        .map_err(directory_error)?;
    Ok(Json(technicians))
}

#[cfg(test)]
#[path = "directory_test.rs"]
mod tests;
