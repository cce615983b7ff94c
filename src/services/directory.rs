//! Directory service: sectors, users and technician availability.
//!
//! DESIGN
//! ======
//! Users carry exactly one role. Technicians are ordinary users with the
//! `technician` role; their workload is the number of issues currently
//! assigned to them that are not yet resolved.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::workflow::Role;

const MAX_CODE_CHARS: usize = 32;
const MAX_NAME_CHARS: usize = 120;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("user not found: {0}")]
    UserNotFound(Uuid),
    #[error("sector not found: {0}")]
    SectorNotFound(Uuid),
    #[error("sector code already exists: {0}")]
    DuplicateSector(String),
    #[error("{0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::error::ErrorCode for DirectoryError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UserNotFound(_) => "E_USER_NOT_FOUND",
            Self::SectorNotFound(_) => "E_SECTOR_NOT_FOUND",
            Self::DuplicateSector(_) => "E_DUPLICATE_SECTOR",
            Self::Validation(_) => "E_VALIDATION",
            Self::Database(_) => "E_DATABASE",
        }
    }
}

// =============================================================================
// SECTORS
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Sector {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSector {
    pub code: String,
    pub name: String,
}

fn sector_from_row(row: &PgRow) -> Result<Sector, sqlx::Error> {
    Ok(Sector {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Normalize a sector code: trimmed, upper-case, `[A-Z0-9-]` only.
///
/// # Errors
///
/// Returns [`DirectoryError::Validation`] for empty, oversize or
/// malformed codes.
pub fn normalize_sector_code(raw: &str) -> Result<String, DirectoryError> {
    let code = raw.trim().to_ascii_uppercase();
    if code.is_empty() || code.chars().count() > MAX_CODE_CHARS {
        return Err(DirectoryError::Validation(format!("sector code must be 1-{MAX_CODE_CHARS} characters")));
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(DirectoryError::Validation("sector code may only contain letters, digits and '-'".into()));
    }
    Ok(code)
}

fn validate_name(raw: &str, what: &str) -> Result<String, DirectoryError> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_CHARS {
        return Err(DirectoryError::Validation(format!("{what} name must be 1-{MAX_NAME_CHARS} characters")));
    }
    Ok(name.to_owned())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

/// # Errors
///
/// Returns a validation error, [`DirectoryError::DuplicateSector`], or a
/// database error.
pub async fn create_sector(pool: &PgPool, input: &NewSector) -> Result<Sector, DirectoryError> {
    let code = normalize_sector_code(&input.code)?;
    let name = validate_name(&input.name, "sector")?;

    let row = sqlx::query("INSERT INTO sectors (id, code, name) VALUES ($1, $2, $3) RETURNING id, code, name, created_at")
        .bind(Uuid::new_v4())
        .bind(&code)
        .bind(&name)
        .fetch_one(pool)
        .await
        .map_err(|e| if is_unique_violation(&e) { DirectoryError::DuplicateSector(code.clone()) } else { e.into() })?;
    let sector = sector_from_row(&row)?;
    info!(sector_id = %sector.id, code = %sector.code, "sector created");
    Ok(sector)
}

/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_sectors(pool: &PgPool) -> Result<Vec<Sector>, DirectoryError> {
    let rows = sqlx::query("SELECT id, code, name, created_at FROM sectors ORDER BY code")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(sector_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(DirectoryError::from)
}

// =============================================================================
// USERS
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
    pub home_sector_id: Option<Uuid>,
    pub specialization: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub home_sector_id: Option<Uuid>,
    #[serde(default)]
    pub specialization: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    pub role: Option<Role>,
    pub sector_id: Option<Uuid>,
}

const USER_COLUMNS: &str = "id, name, role, home_sector_id, specialization, created_at";

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        role: Role::parse(&role).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "role".into(),
            source: format!("unexpected value: {role}").into(),
        })?,
        home_sector_id: row.try_get("home_sector_id")?,
        specialization: row.try_get("specialization")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Parse the requested role. `system` is internal and never assignable.
///
/// # Errors
///
/// Returns [`DirectoryError::Validation`] for unknown roles.
pub fn parse_user_role(raw: &str) -> Result<Role, DirectoryError> {
    Role::parse(raw.trim()).ok_or_else(|| DirectoryError::Validation(format!("unknown role: {raw}")))
}

/// Specialization only means something for technicians; blank becomes `None`.
#[must_use]
pub fn normalize_specialization(role: Role, raw: Option<&str>) -> Option<String> {
    if role != Role::Technician {
        return None;
    }
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_lowercase)
}

/// # Errors
///
/// Returns a validation error, [`DirectoryError::SectorNotFound`] for an
/// unknown home sector, or a database error.
pub async fn create_user(pool: &PgPool, input: &NewUser) -> Result<User, DirectoryError> {
    let name = validate_name(&input.name, "user")?;
    let role = parse_user_role(&input.role)?;
    let specialization = normalize_specialization(role, input.specialization.as_deref());

    if let Some(sector_id) = input.home_sector_id {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM sectors WHERE id = $1)")
            .bind(sector_id)
            .fetch_one(pool)
            .await?;
        if !exists {
            return Err(DirectoryError::SectorNotFound(sector_id));
        }
    }

    let row = sqlx::query(&format!(
        "INSERT INTO users (id, name, role, home_sector_id, specialization)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING {USER_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(&name)
    .bind(role.as_str())
    .bind(input.home_sector_id)
    .bind(&specialization)
    .fetch_one(pool)
    .await?;
    let user = user_from_row(&row)?;
    info!(user_id = %user.id, role = role.as_str(), "user created");
    Ok(user)
}

/// # Errors
///
/// Returns [`DirectoryError::UserNotFound`] or a database error.
pub async fn get_user(pool: &PgPool, user_id: Uuid) -> Result<User, DirectoryError> {
    let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or(DirectoryError::UserNotFound(user_id))?;
    Ok(user_from_row(&row)?)
}

/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_users(pool: &PgPool, filter: &UserFilter) -> Result<Vec<User>, DirectoryError> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT {USER_COLUMNS} FROM users WHERE true"));
    if let Some(role) = filter.role {
        builder.push(" AND role = ").push_bind(role.as_str());
    }
    if let Some(sector_id) = filter.sector_id {
        builder.push(" AND home_sector_id = ").push_bind(sector_id);
    }
    builder.push(" ORDER BY name, id");

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter()
        .map(user_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(DirectoryError::from)
}

/// Create an admin named `name` unless one with that name already exists.
/// Returns the admin's id either way.
///
/// # Errors
///
/// Returns a database error if the lookup or insert fails.
pub async fn ensure_bootstrap_admin(pool: &PgPool, name: &str) -> Result<Uuid, DirectoryError> {
    let name = validate_name(name, "admin")?;
    let existing: Option<Uuid> = sqlx::query_scalar("SELECT id FROM users WHERE role = 'admin' AND name = $1 LIMIT 1")
        .bind(&name)
        .fetch_optional(pool)
        .await?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, name, role) VALUES ($1, $2, 'admin')")
        .bind(id)
        .bind(&name)
        .execute(pool)
        .await?;
    info!(user_id = %id, %name, "bootstrap admin created");
    Ok(id)
}

// =============================================================================
// TECHNICIANS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Busy,
}

#[must_use]
pub fn availability(open_assignments: i64, max_open: i64) -> Availability {
    if open_assignments < max_open { Availability::Available } else { Availability::Busy }
}

#[derive(Debug, Clone, Serialize)]
pub struct Technician {
    #[serde(flatten)]
    pub user: User,
    pub open_assignments: i64,
    pub availability: Availability,
}

#[derive(Debug, Clone, Default)]
pub struct TechnicianFilter {
    pub sector_id: Option<Uuid>,
    pub specialization: Option<String>,
    pub available_only: bool,
}

/// Technicians with their open workload, least loaded first.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_technicians(
    pool: &PgPool,
    filter: &TechnicianFilter,
    max_open: i64,
) -> Result<Vec<Technician>, DirectoryError> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT u.id, u.name, u.role, u.home_sector_id, u.specialization, u.created_at,
                COUNT(i.id) AS open_assignments
         FROM users u
         LEFT JOIN issues i
           ON i.assigned_technician_id = u.id AND i.status IN ('assigned', 'in_progress')
         WHERE u.role = 'technician'",
    );
    if let Some(sector_id) = filter.sector_id {
        builder.push(" AND u.home_sector_id = ").push_bind(sector_id);
    }
    if let Some(spec) = filter.specialization.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        builder.push(" AND u.specialization = ").push_bind(spec.to_ascii_lowercase());
    }
    builder.push(" GROUP BY u.id");
    if filter.available_only {
        builder.push(" HAVING COUNT(i.id) < ").push_bind(max_open);
    }
    builder.push(" ORDER BY open_assignments ASC, u.name ASC");

    let rows = builder.build().fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let open_assignments: i64 = row.try_get("open_assignments")?;
        out.push(Technician {
            user: user_from_row(row)?,
            open_assignments,
            availability: availability(open_assignments, max_open),
        });
    }
    Ok(out)
}

#[cfg(test)]
#[path = "directory_test.rs"]
mod tests;
