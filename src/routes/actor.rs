//! Caller identity.
//!
//! The acting user is asserted by an upstream gateway in the `X-User-Id`
//! header and resolved against `users`. There is no login flow here.

use axum::extract::FromRef;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use uuid::Uuid;

use crate::error::ApiError;
use crate::routes::directory::directory_error;
use crate::services::directory::{self, DirectoryError, User};
use crate::services::issue::Reporter;
use crate::state::AppState;
use crate::workflow::{Actor, Role};

pub const ACTOR_HEADER: &str = "x-user-id";

fn unauthorized(message: &str) -> ApiError {
    ApiError::new(StatusCode::UNAUTHORIZED, "E_UNAUTHORIZED", message)
}

/// Read the caller id from the headers. `Ok(None)` when the header is absent.
///
/// # Errors
///
/// 401 when the header is present but not a UUID.
pub fn actor_id_from_headers(headers: &HeaderMap) -> Result<Option<Uuid>, ApiError> {
    let Some(raw) = headers.get(ACTOR_HEADER) else {
        return Ok(None);
    };
    raw.to_str()
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .map(Some)
        .ok_or_else(|| unauthorized("malformed X-User-Id header"))
}

async fn resolve(state: &AppState, user_id: Uuid) -> Result<User, ApiError> {
    match directory::get_user(&state.pool, user_id).await {
        Ok(user) => Ok(user),
        Err(DirectoryError::UserNotFound(_)) => Err(unauthorized("unknown user")),
        Err(e) => Err(directory_error(e)),
    }
}

// =============================================================================
// EXTRACTORS
// =============================================================================

/// The resolved calling user. Use as a handler parameter to require one.
pub struct CurrentUser {
    pub user: User,
}

impl CurrentUser {
    #[must_use]
    pub fn actor(&self) -> Actor {
        Actor::user(self.user.id, self.user.role)
    }

    #[must_use]
    pub fn reporter(&self) -> Reporter {
        Reporter { id: self.user.id, role: self.user.role, home_sector_id: self.user.home_sector_id }
    }

    /// # Errors
    ///
    /// 403 unless the caller is an admin.
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.user.role == Role::Admin {
            Ok(())
        } else {
            Err(ApiError::new(StatusCode::FORBIDDEN, "E_FORBIDDEN", "admin role required"))
        }
    }
}

impl<S> axum::extract::FromRequestParts<S> for CurrentUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user_id = actor_id_from_headers(&parts.headers)?.ok_or_else(|| unauthorized("missing X-User-Id header"))?;
        let app_state = AppState::from_ref(state);
        let user = resolve(&app_state, user_id).await?;
        Ok(Self { user })
    }
}

/// Like [`CurrentUser`], but an absent header is allowed. A header that is
/// present must still name a known user.
pub struct MaybeUser(pub Option<CurrentUser>);

impl<S> axum::extract::FromRequestParts<S> for MaybeUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Some(user_id) = actor_id_from_headers(&parts.headers)? else {
            return Ok(Self(None));
        };
        let app_state = AppState::from_ref(state);
        let user = resolve(&app_state, user_id).await?;
        Ok(Self(Some(CurrentUser { user })))
    }
}

#[cfg(test)]
#[path = "actor_test.rs"]
mod tests;
