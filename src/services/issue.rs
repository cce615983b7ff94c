//! Issue service: submission, queries, workflow actions and audit trail.
//!
//! DESIGN
//! ======
//! `issues` is the single source of truth for an issue's status. Every
//! status change goes through [`apply_action`] (or [`complete_analysis`]),
//! which in one transaction:
//! 1. locks the row with `SELECT ... FOR UPDATE`,
//! 2. checks the caller's `expected_version` if one was given,
//! 3. asks [`workflow::transition`] for the next status,
//! 4. writes status, assignment and timestamps and bumps `version`,
//! 5. appends one row to `issue_events`.
//!
//! ERROR HANDLING
//! ==============
//! Nothing is written unless every step succeeds; a rejected transition
//! rolls back when the transaction is dropped.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::services::upload::StoredImage;
use crate::workflow::{self, Action, Actor, IssueContext, IssueStatus, Role, Transition, WorkflowError};

pub const MIN_TITLE_CHARS: usize = 5;
pub const MIN_DESCRIPTION_CHARS: usize = 20;
pub const MIN_LOCATION_CHARS: usize = 5;
pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_DESCRIPTION_CHARS: usize = 5000;
pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

const ISSUE_COLUMNS: &str = "id, reference, title, description, category, priority, location, latitude, longitude, \
     sector_id, reporter_id, is_guest_report, status, version, assigned_technician_id, due_at, \
     ai_severity, ai_confidence, ai_reliable, created_at, updated_at, resolved_at";

// =============================================================================
// ENUMS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Roads,
    Water,
    Electricity,
    Garbage,
    Streetlight,
    Drainage,
    Traffic,
    Sanitation,
    Infrastructure,
    Other,
}

impl Category {
    pub const ALL: [Self; 10] = [
        Self::Roads,
        Self::Water,
        Self::Electricity,
        Self::Garbage,
        Self::Streetlight,
        Self::Drainage,
        Self::Traffic,
        Self::Sanitation,
        Self::Infrastructure,
        Self::Other,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Roads => "roads",
            Self::Water => "water",
            Self::Electricity => "electricity",
            Self::Garbage => "garbage",
            Self::Streetlight => "streetlight",
            Self::Drainage => "drainage",
            Self::Traffic => "traffic",
            Self::Sanitation => "sanitation",
            Self::Infrastructure => "infrastructure",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == raw)
    }
}

/// Ordered from least to most pressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Urgent];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == raw)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("issue not found: {0}")]
    NotFound(Uuid),
    #[error("{0}")]
    Validation(String),
    #[error("sector not found: {0}")]
    SectorNotFound(Uuid),
    #[error("{0} is not a technician")]
    NotATechnician(Uuid),
    #[error("issue was modified concurrently (expected version {expected}, found {actual})")]
    VersionConflict { expected: i32, actual: i32 },
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::error::ErrorCode for IssueError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_ISSUE_NOT_FOUND",
            Self::Validation(_) => "E_VALIDATION",
            Self::SectorNotFound(_) => "E_SECTOR_NOT_FOUND",
            Self::NotATechnician(_) => "E_NOT_TECHNICIAN",
            Self::VersionConflict { .. } => "E_VERSION_CONFLICT",
            Self::Workflow(e) => e.error_code(),
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Persisted issue. Mirrors the `issues` table.
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub id: Uuid,
    pub reference: String,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub priority: Priority,
    pub location: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub sector_id: Uuid,
    pub reporter_id: Uuid,
    pub is_guest_report: bool,
    pub status: IssueStatus,
    pub version: i32,
    pub assigned_technician_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub due_at: Option<OffsetDateTime>,
    pub ai_severity: Option<i16>,
    pub ai_confidence: Option<f64>,
    pub ai_reliable: Option<bool>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

impl Issue {
    #[must_use]
    pub fn context(&self) -> IssueContext {
        IssueContext {
            status: self.status,
            is_guest_report: self.is_guest_report,
            assignee: self.assigned_technician_id,
        }
    }
}

/// Submission payload as received from clients.
#[derive(Debug, Clone, Deserialize)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub priority: Option<String>,
    pub location: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub sector_id: Uuid,
}

/// A submission that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidIssue {
    pub title: String,
    pub description: String,
    pub category: Category,
    pub priority: Priority,
    pub location: String,
    pub coordinates: Option<(f64, f64)>,
    pub sector_id: Uuid,
}

/// The reporting user as far as submission cares.
#[derive(Debug, Clone, Copy)]
pub struct Reporter {
    pub id: Uuid,
    pub role: Role,
    pub home_sector_id: Option<Uuid>,
}

/// What the image model found, applied on `analysis_completed`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AiFindings {
    pub severity: u8,
    pub confidence: f64,
    pub reliable: bool,
    pub suggested_priority: Priority,
}

/// One row of the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct IssueEvent {
    pub id: i64,
    pub issue_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub actor_role: String,
    pub action: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub note: Option<String>,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssueImage {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub stored_name: String,
    pub original_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Query filters for [`list_issues`].
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub status: Option<IssueStatus>,
    pub sector_id: Option<Uuid>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub is_guest_report: Option<bool>,
    pub reporter_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub query: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Validate a submission without touching the database.
///
/// # Errors
///
/// Returns [`IssueError::Validation`] naming the first offending field.
pub fn validate_new_issue(input: &NewIssue) -> Result<ValidIssue, IssueError> {
    let title = input.title.trim();
    let description = input.description.trim();
    let location = input.location.trim();

    let title_len = title.chars().count();
    if title_len < MIN_TITLE_CHARS {
        return Err(IssueError::Validation(format!("title must be at least {MIN_TITLE_CHARS} characters")));
    }
    if title_len > MAX_TITLE_CHARS {
        return Err(IssueError::Validation(format!("title must be at most {MAX_TITLE_CHARS} characters")));
    }
    let description_len = description.chars().count();
    if description_len < MIN_DESCRIPTION_CHARS {
        return Err(IssueError::Validation(format!(
            "description must be at least {MIN_DESCRIPTION_CHARS} characters"
        )));
    }
    if description_len > MAX_DESCRIPTION_CHARS {
        return Err(IssueError::Validation(format!(
            "description must be at most {MAX_DESCRIPTION_CHARS} characters"
        )));
    }
    if location.chars().count() < MIN_LOCATION_CHARS {
        return Err(IssueError::Validation(format!(
            "location must be at least {MIN_LOCATION_CHARS} characters"
        )));
    }

    let category = Category::parse(input.category.trim())
        .ok_or_else(|| IssueError::Validation(format!("unknown category: {}", input.category)))?;
    let priority = match input.priority.as_deref().map(str::trim) {
        None | Some("") => Priority::Medium,
        Some(raw) => Priority::parse(raw).ok_or_else(|| IssueError::Validation(format!("unknown priority: {raw}")))?,
    };

    let coordinates = match (input.latitude, input.longitude) {
        (None, None) => None,
        (Some(lat), Some(lon)) => {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(IssueError::Validation("coordinates out of range".into()));
            }
            Some((lat, lon))
        }
        _ => return Err(IssueError::Validation("latitude and longitude must be given together".into())),
    };

    Ok(ValidIssue {
        title: title.to_owned(),
        description: description.to_owned(),
        category,
        priority,
        location: location.to_owned(),
        coordinates,
        sector_id: input.sector_id,
    })
}

/// A report filed outside the reporter's home sector. Reporters without a
/// registered home sector are treated as residents.
#[must_use]
pub fn is_guest_report(home_sector_id: Option<Uuid>, issue_sector_id: Uuid) -> bool {
    home_sector_id.is_some_and(|home| home != issue_sector_id)
}

#[must_use]
pub fn format_reference(is_guest: bool, seq: i64) -> String {
    let prefix = if is_guest { "GUEST" } else { "ISSUE" };
    format!("{prefix}-{seq}")
}

/// Raise priority to the model's suggestion, never lower it.
#[must_use]
pub fn escalate(current: Priority, suggested: Priority) -> Priority {
    current.max(suggested)
}

/// Escape `%`, `_` and `\` for use inside an `ILIKE` pattern.
#[must_use]
pub fn like_pattern(query: &str) -> String {
    let mut out = String::with_capacity(query.len() + 2);
    out.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[must_use]
pub fn clamp_page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = offset.unwrap_or(0).max(0);
    (limit, offset)
}

// =============================================================================
// UPDATE PLANNING
// =============================================================================

/// Column values written for an accepted transition.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueUpdate {
    pub status: IssueStatus,
    pub assigned_technician_id: Option<Uuid>,
    pub due_at: Option<OffsetDateTime>,
    pub resolved_at: Option<OffsetDateTime>,
    pub priority: Priority,
    pub ai: Option<AiFindings>,
}

/// Work out every column a transition touches.
///
/// Leaving the assigned statuses clears the assignee and due date;
/// `resolved_at` is only set while resolved.
#[must_use]
pub fn plan_update(
    issue: &Issue,
    transition: &Transition,
    action: &Action,
    findings: Option<AiFindings>,
    now: OffsetDateTime,
) -> IssueUpdate {
    let (assigned_technician_id, due_at) = match action {
        Action::Assign { technician_id, due_at } => (Some(*technician_id), *due_at),
        _ if transition.to.has_assignee() => (issue.assigned_technician_id, issue.due_at),
        _ => (None, None),
    };
    let resolved_at = (transition.to == IssueStatus::Resolved).then_some(now);
    let priority = findings.map_or(issue.priority, |f| escalate(issue.priority, f.suggested_priority));

    IssueUpdate { status: transition.to, assigned_technician_id, due_at, resolved_at, priority, ai: findings }
}

fn event_payload(action: &Action, findings: Option<&AiFindings>, prev_assignee: Option<Uuid>) -> serde_json::Value {
    match (action, findings) {
        (Action::Assign { technician_id, due_at }, _) => serde_json::json!({
            "technician_id": technician_id,
            "previous_technician_id": prev_assignee,
            "due_at": due_at.and_then(|d| d.format(&time::format_description::well_known::Rfc3339).ok()),
        }),
        (_, Some(f)) => serde_json::json!({
            "severity": f.severity,
            "confidence": f.confidence,
            "reliable": f.reliable,
            "suggested_priority": f.suggested_priority.as_str(),
        }),
        _ => serde_json::json!({}),
    }
}

// =============================================================================
// ROW MAPPING
// =============================================================================

fn decode_err(column: &str, raw: &str) -> sqlx::Error {
    sqlx::Error::ColumnDecode { index: column.to_owned(), source: format!("unexpected value: {raw}").into() }
}

fn issue_from_row(row: &PgRow) -> Result<Issue, sqlx::Error> {
    let category: String = row.try_get("category")?;
    let priority: String = row.try_get("priority")?;
    let status: String = row.try_get("status")?;
    Ok(Issue {
        id: row.try_get("id")?,
        reference: row.try_get("reference")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        category: Category::parse(&category).ok_or_else(|| decode_err("category", &category))?,
        priority: Priority::parse(&priority).ok_or_else(|| decode_err("priority", &priority))?,
        location: row.try_get("location")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        sector_id: row.try_get("sector_id")?,
        reporter_id: row.try_get("reporter_id")?,
        is_guest_report: row.try_get("is_guest_report")?,
        status: IssueStatus::parse(&status).ok_or_else(|| decode_err("status", &status))?,
        version: row.try_get("version")?,
        assigned_technician_id: row.try_get("assigned_technician_id")?,
        due_at: row.try_get("due_at")?,
        ai_severity: row.try_get("ai_severity")?,
        ai_confidence: row.try_get("ai_confidence")?,
        ai_reliable: row.try_get("ai_reliable")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<IssueEvent, sqlx::Error> {
    Ok(IssueEvent {
        id: row.try_get("id")?,
        issue_id: row.try_get("issue_id")?,
        actor_id: row.try_get("actor_id")?,
        actor_role: row.try_get("actor_role")?,
        action: row.try_get("action")?,
        from_status: row.try_get("from_status")?,
        to_status: row.try_get("to_status")?,
        note: row.try_get("note")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
    })
}

fn image_from_row(row: &PgRow) -> Result<IssueImage, sqlx::Error> {
    Ok(IssueImage {
        id: row.try_get("id")?,
        issue_id: row.try_get("issue_id")?,
        stored_name: row.try_get("stored_name")?,
        original_name: row.try_get("original_name")?,
        content_type: row.try_get("content_type")?,
        size_bytes: row.try_get("size_bytes")?,
        sha256: row.try_get("sha256")?,
        created_at: row.try_get("created_at")?,
    })
}

// =============================================================================
// CRUD
// =============================================================================

/// Submit a new issue. It starts in `submitted`.
///
/// # Errors
///
/// Returns a validation error, [`IssueError::SectorNotFound`], or a
/// database error.
pub async fn create_issue(pool: &PgPool, reporter: Reporter, input: &NewIssue) -> Result<Issue, IssueError> {
    let valid = validate_new_issue(input)?;

    let sector_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM sectors WHERE id = $1)")
        .bind(valid.sector_id)
        .fetch_one(pool)
        .await?;
    if !sector_exists {
        return Err(IssueError::SectorNotFound(valid.sector_id));
    }

    let guest = is_guest_report(reporter.home_sector_id, valid.sector_id);
    let mut tx = pool.begin().await?;

    let seq: i64 = sqlx::query_scalar("SELECT nextval('issue_reference_seq')")
        .fetch_one(tx.as_mut())
        .await?;
    let reference = format_reference(guest, seq);
    let (latitude, longitude) = valid.coordinates.unzip();

    let row = sqlx::query(&format!(
        "INSERT INTO issues (id, reference, title, description, category, priority, location, latitude, longitude,
                             sector_id, reporter_id, is_guest_report, status)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
         RETURNING {ISSUE_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(&reference)
    .bind(&valid.title)
    .bind(&valid.description)
    .bind(valid.category.as_str())
    .bind(valid.priority.as_str())
    .bind(&valid.location)
    .bind(latitude)
    .bind(longitude)
    .bind(valid.sector_id)
    .bind(reporter.id)
    .bind(guest)
    .bind(IssueStatus::Submitted.as_str())
    .fetch_one(tx.as_mut())
    .await?;
    let issue = issue_from_row(&row)?;

    insert_event(
        &mut tx,
        issue.id,
        Some(reporter.id),
        reporter.role.as_str(),
        "submitted",
        None,
        IssueStatus::Submitted,
        None,
        &serde_json::json!({ "is_guest_report": guest }),
    )
    .await?;
    tx.commit().await?;

    info!(issue_id = %issue.id, reference = %issue.reference, guest, category = issue.category.as_str(), "issue submitted");
    Ok(issue)
}

/// Fetch one issue.
///
/// # Errors
///
/// Returns [`IssueError::NotFound`] or a database error.
pub async fn get_issue(pool: &PgPool, issue_id: Uuid) -> Result<Issue, IssueError> {
    let row = sqlx::query(&format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = $1"))
        .bind(issue_id)
        .fetch_optional(pool)
        .await?
        .ok_or(IssueError::NotFound(issue_id))?;
    Ok(issue_from_row(&row)?)
}

/// List issues newest first.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_issues(pool: &PgPool, filter: &IssueFilter) -> Result<Vec<Issue>, IssueError> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE true"));

    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(sector_id) = filter.sector_id {
        builder.push(" AND sector_id = ").push_bind(sector_id);
    }
    if let Some(category) = filter.category {
        builder.push(" AND category = ").push_bind(category.as_str());
    }
    if let Some(priority) = filter.priority {
        builder.push(" AND priority = ").push_bind(priority.as_str());
    }
    if let Some(guest) = filter.is_guest_report {
        builder.push(" AND is_guest_report = ").push_bind(guest);
    }
    if let Some(reporter_id) = filter.reporter_id {
        builder.push(" AND reporter_id = ").push_bind(reporter_id);
    }
    if let Some(assignee_id) = filter.assignee_id {
        builder.push(" AND assigned_technician_id = ").push_bind(assignee_id);
    }
    if let Some(query) = filter.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        let pattern = like_pattern(query);
        builder
            .push(" AND (title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR description ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR location ILIKE ")
            .push_bind(pattern)
            .push(")");
    }

    let (limit, offset) = clamp_page(filter.limit, filter.offset);
    builder
        .push(" ORDER BY created_at DESC, id ASC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter()
        .map(issue_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(IssueError::from)
}

// =============================================================================
// WORKFLOW ACTIONS
// =============================================================================

/// Apply a workflow action to an issue.
///
/// # Errors
///
/// Returns [`IssueError::NotFound`], [`IssueError::VersionConflict`],
/// [`IssueError::Workflow`], [`IssueError::NotATechnician`] or a database
/// error. Nothing is written on error.
pub async fn apply_action(
    pool: &PgPool,
    issue_id: Uuid,
    actor: &Actor,
    action: &Action,
    expected_version: Option<i32>,
) -> Result<(Issue, IssueEvent), IssueError> {
    apply_in_tx(pool, issue_id, actor, action, expected_version, None).await
}

/// Record a finished analysis: moves `ai_analysis` to `moderation` or
/// `verification` and stores the model's findings.
///
/// # Errors
///
/// Same as [`apply_action`].
pub async fn complete_analysis(pool: &PgPool, issue_id: Uuid, findings: AiFindings) -> Result<(Issue, IssueEvent), IssueError> {
    let action = Action::AnalysisCompleted { reliable: findings.reliable };
    apply_in_tx(pool, issue_id, &Actor::system(), &action, None, Some(findings)).await
}

async fn apply_in_tx(
    pool: &PgPool,
    issue_id: Uuid,
    actor: &Actor,
    action: &Action,
    expected_version: Option<i32>,
    findings: Option<AiFindings>,
) -> Result<(Issue, IssueEvent), IssueError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(&format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = $1 FOR UPDATE"))
        .bind(issue_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(IssueError::NotFound(issue_id))?;
    let current = issue_from_row(&row)?;

    if let Some(expected) = expected_version {
        if expected != current.version {
            return Err(IssueError::VersionConflict { expected, actual: current.version });
        }
    }

    let transition = workflow::transition(&current.context(), action, actor)?;

    if let Action::Assign { technician_id, .. } = action {
        let is_technician: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1 AND role = 'technician')")
                .bind(technician_id)
                .fetch_one(tx.as_mut())
                .await?;
        if !is_technician {
            return Err(IssueError::NotATechnician(*technician_id));
        }
    }

    let update = plan_update(&current, &transition, action, findings, OffsetDateTime::now_utc());
    let ai = update.ai;
    let row = sqlx::query(&format!(
        "UPDATE issues SET
             status = $2,
             assigned_technician_id = $3,
             due_at = $4,
             resolved_at = $5,
             priority = $6,
             ai_severity = COALESCE($7, ai_severity),
             ai_confidence = COALESCE($8, ai_confidence),
             ai_reliable = COALESCE($9, ai_reliable),
             version = version + 1,
             updated_at = now()
         WHERE id = $1
         RETURNING {ISSUE_COLUMNS}"
    ))
    .bind(issue_id)
    .bind(update.status.as_str())
    .bind(update.assigned_technician_id)
    .bind(update.due_at)
    .bind(update.resolved_at)
    .bind(update.priority.as_str())
    .bind(ai.map(|f| i16::from(f.severity)))
    .bind(ai.map(|f| f.confidence))
    .bind(ai.map(|f| f.reliable))
    .fetch_one(tx.as_mut())
    .await?;
    let updated = issue_from_row(&row)?;

    let payload = event_payload(action, findings.as_ref(), current.assigned_technician_id);
    let event = insert_event(
        &mut tx,
        issue_id,
        actor.user_id,
        actor.role.as_str(),
        transition.action.as_str(),
        Some(transition.from),
        transition.to,
        action.note(),
        &payload,
    )
    .await?;
    tx.commit().await?;

    info!(
        %issue_id,
        action = transition.action.as_str(),
        from = transition.from.as_str(),
        to = transition.to.as_str(),
        actor_role = actor.role.as_str(),
        version = updated.version,
        "issue transitioned"
    );
    Ok((updated, event))
}

#[allow(clippy::too_many_arguments)]
async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    issue_id: Uuid,
    actor_id: Option<Uuid>,
    actor_role: &str,
    action: &str,
    from: Option<IssueStatus>,
    to: IssueStatus,
    note: Option<&str>,
    payload: &serde_json::Value,
) -> Result<IssueEvent, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO issue_events (issue_id, actor_id, actor_role, action, from_status, to_status, note, payload)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING id, issue_id, actor_id, actor_role, action, from_status, to_status, note, payload, created_at",
    )
    .bind(issue_id)
    .bind(actor_id)
    .bind(actor_role)
    .bind(action)
    .bind(from.map(IssueStatus::as_str))
    .bind(to.as_str())
    .bind(note)
    .bind(payload)
    .fetch_one(tx.as_mut())
    .await?;
    event_from_row(&row)
}

/// Audit trail for an issue, oldest first.
///
/// # Errors
///
/// Returns [`IssueError::NotFound`] or a database error.
pub async fn list_events(pool: &PgPool, issue_id: Uuid) -> Result<Vec<IssueEvent>, IssueError> {
    let rows = sqlx::query(
        "SELECT id, issue_id, actor_id, actor_role, action, from_status, to_status, note, payload, created_at
         FROM issue_events WHERE issue_id = $1 ORDER BY id ASC",
    )
    .bind(issue_id)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        // Every issue has at least its `submitted` event.
        return Err(IssueError::NotFound(issue_id));
    }
    rows.iter()
        .map(event_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(IssueError::from)
}

// =============================================================================
// IMAGES
// =============================================================================

/// Record a stored photo against an issue.
///
/// # Errors
///
/// Returns [`IssueError::NotFound`] or a database error.
pub async fn attach_image(pool: &PgPool, issue_id: Uuid, image: &StoredImage) -> Result<IssueImage, IssueError> {
    let row = sqlx::query(
        "INSERT INTO issue_images (id, issue_id, stored_name, original_name, content_type, size_bytes, sha256)
         SELECT $1, id, $3, $4, $5, $6, $7 FROM issues WHERE id = $2
         RETURNING id, issue_id, stored_name, original_name, content_type, size_bytes, sha256, created_at",
    )
    .bind(Uuid::new_v4())
    .bind(issue_id)
    .bind(&image.stored_name)
    .bind(&image.original_name)
    .bind(image.content_type)
    .bind(image.size_bytes)
    .bind(&image.sha256)
    .fetch_optional(pool)
    .await?
    .ok_or(IssueError::NotFound(issue_id))?;
    Ok(image_from_row(&row)?)
}

/// Photos attached to an issue, in upload order.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_images(pool: &PgPool, issue_id: Uuid) -> Result<Vec<IssueImage>, IssueError> {
    let rows = sqlx::query(
        "SELECT id, issue_id, stored_name, original_name, content_type, size_bytes, sha256, created_at
         FROM issue_images WHERE issue_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(issue_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(image_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(IssueError::from)
}

/// Other issues that already carry a photo with the same digest.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn find_duplicate_images(pool: &PgPool, issue_id: Uuid, sha256: &str) -> Result<Vec<String>, IssueError> {
    let refs = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT i.reference
         FROM issue_images img
         JOIN issues i ON i.id = img.issue_id
         WHERE img.sha256 = $1 AND img.issue_id <> $2
         ORDER BY i.reference",
    )
    .bind(sha256)
    .bind(issue_id)
    .fetch_all(pool)
    .await?;
    Ok(refs)
}

/// Issues sitting in `status` without any change for `older_than_secs`,
/// oldest first.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn stale_in_status(
    pool: &PgPool,
    status: IssueStatus,
    older_than_secs: i64,
    limit: i64,
) -> Result<Vec<Uuid>, IssueError> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM issues
         WHERE status = $1 AND updated_at < now() - ($2 * interval '1 second')
         ORDER BY updated_at ASC
         LIMIT $3",
    )
    .bind(status.as_str())
    .bind(older_than_secs)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[cfg(test)]
#[path = "issue_test.rs"]
mod tests;
