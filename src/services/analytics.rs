//! Analytics service: dashboard aggregates computed from persisted issues.
//!
//! Aggregation happens in SQL; shaping (zero-filling, rates, points) in the
//! pure helpers below so it can be tested without a database.

use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::workflow::IssueStatus;

pub const POINTS_PER_REPORT: i64 = 10;
pub const POINTS_PER_APPROVED: i64 = 25;
pub const POINTS_PER_RESOLVED: i64 = 15;
pub const DEFAULT_LEADERBOARD_SIZE: i64 = 10;
pub const MAX_LEADERBOARD_SIZE: i64 = 100;

/// Statuses an issue reaches only after moderator approval.
pub const APPROVED_OR_LATER: [IssueStatus; 4] =
    [IssueStatus::Approved, IssueStatus::Assigned, IssueStatus::InProgress, IssueStatus::Resolved];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Summary {
    pub total: i64,
    pub open: i64,
    pub resolved: i64,
    pub rejected: i64,
    /// Resolved share of all issues, 0.0 to 1.0.
    pub resolution_rate: f64,
    pub mean_resolution_hours: Option<f64>,
    /// Guest reports as a share of all issues, 0.0 to 1.0.
    pub guest_share: f64,
    pub by_status: BTreeMap<String, i64>,
    pub by_category: BTreeMap<String, i64>,
    pub by_sector: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: Uuid,
    pub name: String,
    pub reports: i64,
    pub approved: i64,
    pub resolved: i64,
    pub points: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SectorQueue {
    pub sector_id: Uuid,
    pub code: String,
    pub name: String,
    pub pending_analysis: i64,
    pub verification: i64,
    pub moderation: i64,
}

// =============================================================================
// PURE HELPERS
// =============================================================================

#[must_use]
pub fn leaderboard_points(reports: i64, approved: i64, resolved: i64) -> i64 {
    reports * POINTS_PER_REPORT + approved * POINTS_PER_APPROVED + resolved * POINTS_PER_RESOLVED
}

#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn ratio(part: i64, whole: i64) -> f64 {
    if whole <= 0 { 0.0 } else { part as f64 / whole as f64 }
}

/// Every status gets a key, zero when absent.
#[must_use]
pub fn status_counts(rows: &[(String, i64)]) -> BTreeMap<String, i64> {
    let mut out: BTreeMap<String, i64> = IssueStatus::ALL.iter().map(|s| (s.as_str().to_owned(), 0)).collect();
    for (status, count) in rows {
        *out.entry(status.clone()).or_default() += count;
    }
    out
}

#[must_use]
pub fn summarize(
    status_rows: &[(String, i64)],
    by_category: BTreeMap<String, i64>,
    by_sector: BTreeMap<String, i64>,
    guest_reports: i64,
    mean_resolution_hours: Option<f64>,
) -> Summary {
    let by_status = status_counts(status_rows);
    let total: i64 = by_status.values().sum();
    let count = |s: IssueStatus| by_status.get(s.as_str()).copied().unwrap_or(0);
    let resolved = count(IssueStatus::Resolved);
    let rejected = count(IssueStatus::Rejected);

    Summary {
        total,
        open: total - resolved - rejected,
        resolved,
        rejected,
        resolution_rate: ratio(resolved, total),
        mean_resolution_hours,
        guest_share: ratio(guest_reports, total),
        by_status,
        by_category,
        by_sector,
    }
}

/// Per-citizen counts as read from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CitizenTally {
    pub user_id: Uuid,
    pub name: String,
    pub reports: i64,
    pub approved: i64,
    pub resolved: i64,
}

/// Score, sort (points desc, then name, then id) and cut to `limit`.
#[must_use]
pub fn rank_leaderboard(tallies: Vec<CitizenTally>, limit: usize) -> Vec<LeaderboardEntry> {
    let mut scored: Vec<(i64, CitizenTally)> = tallies
        .into_iter()
        .map(|t| (leaderboard_points(t.reports, t.approved, t.resolved), t))
        .collect();
    scored.sort_by(|(pa, a), (pb, b)| pb.cmp(pa).then_with(|| a.name.cmp(&b.name)).then_with(|| a.user_id.cmp(&b.user_id)));

    scored
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, (points, t))| LeaderboardEntry {
            rank: i + 1,
            user_id: t.user_id,
            name: t.name,
            reports: t.reports,
            approved: t.approved,
            resolved: t.resolved,
            points,
        })
        .collect()
}

fn status_list(statuses: &[IssueStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_owned()).collect()
}

// =============================================================================
// QUERIES
// =============================================================================

async fn grouped_counts(pool: &PgPool, sql: &str) -> Result<Vec<(String, i64)>, sqlx::Error> {
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    rows.iter()
        .map(|r| Ok::<_, sqlx::Error>((r.try_get::<String, _>("key")?, r.try_get::<i64, _>("n")?)))
        .collect()
}

/// # Errors
///
/// Returns a database error if any aggregate query fails.
pub async fn summary(pool: &PgPool) -> Result<Summary, sqlx::Error> {
    let status_rows = grouped_counts(pool, "SELECT status AS key, COUNT(*) AS n FROM issues GROUP BY status").await?;
    let by_category: BTreeMap<String, i64> =
        grouped_counts(pool, "SELECT category AS key, COUNT(*) AS n FROM issues GROUP BY category")
            .await?
            .into_iter()
            .collect();
    let by_sector: BTreeMap<String, i64> = grouped_counts(
        pool,
        "SELECT s.code AS key, COUNT(i.id) AS n
         FROM sectors s LEFT JOIN issues i ON i.sector_id = s.id
         GROUP BY s.code",
    )
    .await?
    .into_iter()
    .collect();

    let row = sqlx::query(
        "SELECT COUNT(*) FILTER (WHERE is_guest_report) AS guests,
                (AVG(EXTRACT(EPOCH FROM (resolved_at - created_at))) / 3600.0)::float8 AS mean_hours
         FROM issues",
    )
    .fetch_one(pool)
    .await?;
    let guests: i64 = row.try_get("guests")?;
    let mean_hours: Option<f64> = row.try_get("mean_hours")?;

    Ok(summarize(&status_rows, by_category, by_sector, guests, mean_hours))
}

/// Top citizens by points.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn leaderboard(pool: &PgPool, limit: Option<i64>) -> Result<Vec<LeaderboardEntry>, sqlx::Error> {
    let limit = limit.unwrap_or(DEFAULT_LEADERBOARD_SIZE).clamp(1, MAX_LEADERBOARD_SIZE);
    let rows = sqlx::query(
        "SELECT u.id, u.name,
                COUNT(i.id) AS reports,
                COUNT(i.id) FILTER (WHERE i.status = ANY($1)) AS approved,
                COUNT(i.id) FILTER (WHERE i.status = 'resolved') AS resolved
         FROM users u
         JOIN issues i ON i.reporter_id = u.id
         WHERE u.role = 'citizen'
         GROUP BY u.id, u.name",
    )
    .bind(status_list(&APPROVED_OR_LATER))
    .fetch_all(pool)
    .await?;

    let tallies = rows
        .iter()
        .map(|r| {
            Ok::<_, sqlx::Error>(CitizenTally {
                user_id: r.try_get("id")?,
                name: r.try_get("name")?,
                reports: r.try_get("reports")?,
                approved: r.try_get("approved")?,
                resolved: r.try_get("resolved")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rank_leaderboard(tallies, usize::try_from(limit).unwrap_or(usize::MAX)))
}

/// Issues waiting on moderators, per sector.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn sector_queues(pool: &PgPool) -> Result<Vec<SectorQueue>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT s.id, s.code, s.name,
                COUNT(i.id) FILTER (WHERE i.status IN ('submitted', 'ai_analysis')) AS pending_analysis,
                COUNT(i.id) FILTER (WHERE i.status = 'verification') AS verification,
                COUNT(i.id) FILTER (WHERE i.status = 'moderation') AS moderation
         FROM sectors s
         LEFT JOIN issues i ON i.sector_id = s.id
         GROUP BY s.id, s.code, s.name
         ORDER BY (COUNT(i.id) FILTER (WHERE i.status IN ('verification', 'moderation'))) DESC, s.code",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| {
            Ok::<_, sqlx::Error>(SectorQueue {
                sector_id: r.try_get("id")?,
                code: r.try_get("code")?,
                name: r.try_get("name")?,
                pending_analysis: r.try_get("pending_analysis")?,
                verification: r.try_get("verification")?,
                moderation: r.try_get("moderation")?,
            })
        })
        .collect()
}

#[cfg(test)]
#[path = "analytics_test.rs"]
mod tests;
