//! Analysis worker: moves new issues through AI analysis in the background.
//!
//! DESIGN
//! ======
//! Submitting requests push issue ids onto a bounded queue with `try_send`
//! and return immediately. `ANALYSIS_WORKERS` tasks share the receiver and
//! run one job at a time each:
//! 1. no analyzer configured or no photo attached: `skip_analysis`
//! 2. otherwise `begin_analysis`, run the model on the first photo, then
//!    `analysis_completed` with the findings or `analysis_failed`.
//!
//! A periodic sweep re-enqueues issues left in `submitted` (queue was full
//! or the process restarted) and fails issues stuck in `ai_analysis` after
//! a crash mid-job.
//!
//! ERROR HANDLING
//! ==============
//! Retryable analyzer errors (timeouts, 5xx from a model server) are retried
//! with exponential back-off plus jitter. Every attempt is recorded in
//! `analyses`. Workflow conflicts mean another worker or a moderator got
//! there first and the job is dropped quietly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::PgPool;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{UploadConfig, env_bool, env_parse};
use crate::error::ErrorCode;
use crate::services::analysis::{self, AnalysisError, AnalysisReport, ImageAnalyzer};
use crate::services::issue::{self, IssueError};
use crate::services::upload;
use crate::workflow::{Action, Actor, IssueStatus, WorkflowError};

const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_WORKERS: usize = 2;
const DEFAULT_RETRIES: u32 = 2;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_STALE_SUBMITTED_SECS: i64 = 120;
const DEFAULT_STUCK_ANALYSIS_SECS: i64 = 900;
const SWEEP_BATCH: i64 = 100;

/// Tuning knobs for the analysis workers, loaded from environment variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Bounded channel capacity for queued issue ids.
    pub queue_capacity: usize,
    /// Number of worker tasks sharing the queue.
    pub workers: usize,
    /// Extra attempts after a retryable analyzer failure.
    pub retries: u32,
    /// Base delay for exponential back-off, in milliseconds.
    pub retry_base_ms: u64,
    /// Run the periodic sweep at all (`ANALYSIS_SWEEP`).
    pub sweep: bool,
    pub sweep_interval_secs: u64,
    /// Age after which a `submitted` issue is re-enqueued.
    pub stale_submitted_secs: i64,
    /// Age after which an `ai_analysis` issue is declared failed.
    pub stuck_analysis_secs: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            retries: DEFAULT_RETRIES,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            sweep: true,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            stale_submitted_secs: DEFAULT_STALE_SUBMITTED_SECS,
            stuck_analysis_secs: DEFAULT_STUCK_ANALYSIS_SECS,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            queue_capacity: env_parse("ANALYSIS_QUEUE_CAPACITY", d.queue_capacity).max(1),
            workers: env_parse("ANALYSIS_WORKERS", d.workers).max(1),
            retries: env_parse("ANALYSIS_RETRIES", d.retries),
            retry_base_ms: env_parse("ANALYSIS_RETRY_BASE_MS", d.retry_base_ms),
            sweep: env_bool("ANALYSIS_SWEEP").unwrap_or(d.sweep),
            sweep_interval_secs: env_parse("ANALYSIS_SWEEP_INTERVAL_SECS", d.sweep_interval_secs).max(1),
            stale_submitted_secs: env_parse("ANALYSIS_STALE_SUBMITTED_SECS", d.stale_submitted_secs),
            stuck_analysis_secs: env_parse("ANALYSIS_STUCK_SECS", d.stuck_analysis_secs),
        }
    }
}

/// What a worker needs from the application.
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: PgPool,
    pub analyzer: Option<Arc<dyn ImageAnalyzer>>,
    pub uploads: UploadConfig,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { to: IssueStatus },
    Failed { reason: String },
    Skipped { reason: &'static str },
    /// The issue had already left `submitted`.
    AlreadyHandled,
}

// =============================================================================
// SPAWN / ENQUEUE
// =============================================================================

/// Spawn the worker pool and return the queue sender plus task handles.
#[must_use]
pub fn spawn_analysis_workers(ctx: WorkerContext, config: WorkerConfig) -> (mpsc::Sender<Uuid>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel::<Uuid>(config.queue_capacity);
    let rx = Arc::new(Mutex::new(rx));

    info!(
        queue_capacity = config.queue_capacity,
        workers = config.workers,
        retries = config.retries,
        retry_base_ms = config.retry_base_ms,
        analyzer = ctx.analyzer.as_ref().map_or("none", |a| a.model_version()),
        "analysis workers configured"
    );

    let handles = (0..config.workers)
        .map(|worker| {
            let ctx = ctx.clone();
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    // Hold the lock only while waiting for the next id.
                    let next = rx.lock().await.recv().await;
                    let Some(issue_id) = next else {
                        info!(worker, "analysis queue closed; worker exiting");
                        break;
                    };
                    match process_issue(&ctx, issue_id, config).await {
                        Ok(outcome) => info!(worker, %issue_id, ?outcome, "analysis job finished"),
                        Err(e) => error!(worker, %issue_id, error = %e, "analysis job failed"),
                    }
                }
            })
        })
        .collect();

    (tx, handles)
}

/// Best-effort, non-blocking enqueue. Returns `true` if the id was queued.
///
/// A full or closed queue leaves the issue in `submitted` for the sweep.
pub fn enqueue_analysis(tx: Option<&mpsc::Sender<Uuid>>, issue_id: Uuid) -> bool {
    let Some(tx) = tx else {
        return false;
    };
    match tx.try_send(issue_id) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(%issue_id, "analysis queue full; leaving issue for sweep");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!(%issue_id, "analysis queue closed; leaving issue for sweep");
            false
        }
    }
}

/// Spawn the periodic sweep for stale and stuck issues.
pub fn spawn_sweep(ctx: WorkerContext, tx: mpsc::Sender<Uuid>, config: WorkerConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }
            if let Err(e) = sweep_once(&ctx, &tx, config).await {
                warn!(error = %e, "analysis sweep failed");
            }
        }
    })
}

async fn sweep_once(ctx: &WorkerContext, tx: &mpsc::Sender<Uuid>, config: WorkerConfig) -> Result<(), IssueError> {
    let stale = issue::stale_in_status(&ctx.pool, IssueStatus::Submitted, config.stale_submitted_secs, SWEEP_BATCH).await?;
    let queued = stale
        .iter()
        .filter(|id| enqueue_analysis(Some(tx), **id))
        .count();

    let stuck = issue::stale_in_status(&ctx.pool, IssueStatus::AiAnalysis, config.stuck_analysis_secs, SWEEP_BATCH).await?;
    for issue_id in &stuck {
        let action = Action::AnalysisFailed { reason: "analysis did not finish".into() };
        match issue::apply_action(&ctx.pool, *issue_id, &Actor::system(), &action, None).await {
            Ok(_) | Err(IssueError::Workflow(_)) => {}
            Err(e) => warn!(%issue_id, error = %e, "could not fail stuck analysis"),
        }
    }

    if !stale.is_empty() || !stuck.is_empty() {
        info!(stale = stale.len(), queued, stuck = stuck.len(), "analysis sweep");
    }
    Ok(())
}

// =============================================================================
// JOB
// =============================================================================

/// Run one issue through analysis.
///
/// # Errors
///
/// Returns an error for database failures. Workflow conflicts (the issue
/// moved on concurrently) are reported as [`JobOutcome::AlreadyHandled`].
pub async fn process_issue(ctx: &WorkerContext, issue_id: Uuid, config: WorkerConfig) -> Result<JobOutcome, IssueError> {
    let current = issue::get_issue(&ctx.pool, issue_id).await?;
    if current.status != IssueStatus::Submitted {
        return Ok(JobOutcome::AlreadyHandled);
    }

    let Some(analyzer) = ctx.analyzer.as_deref() else {
        return skip(ctx, issue_id, "image analysis not configured").await;
    };
    let Some(image) = issue::list_images(&ctx.pool, issue_id).await?.into_iter().next() else {
        return skip(ctx, issue_id, "no image attached").await;
    };

    match issue::apply_action(&ctx.pool, issue_id, &Actor::system(), &Action::BeginAnalysis, None).await {
        Ok(_) => {}
        Err(IssueError::Workflow(WorkflowError::InvalidTransition { .. })) => return Ok(JobOutcome::AlreadyHandled),
        Err(e) => return Err(e),
    }

    let result = match upload::stored_path(&ctx.uploads, &image.stored_name) {
        Some(path) => analyze_with_retry(ctx, analyzer, issue_id, image.id, &path, config).await,
        None => Err(AnalysisError::InvalidOutput(format!("invalid stored image name: {}", image.stored_name))),
    };

    let applied = match result {
        Ok(report) => issue::complete_analysis(&ctx.pool, issue_id, report.findings())
            .await
            .map(|(updated, _)| JobOutcome::Completed { to: updated.status }),
        Err(e) => {
            let reason = e.to_string();
            let action = Action::AnalysisFailed { reason: reason.clone() };
            issue::apply_action(&ctx.pool, issue_id, &Actor::system(), &action, None)
                .await
                .map(|_| JobOutcome::Failed { reason })
        }
    };
    match applied {
        Err(IssueError::Workflow(_)) => Ok(JobOutcome::AlreadyHandled),
        other => other,
    }
}

async fn skip(ctx: &WorkerContext, issue_id: Uuid, reason: &'static str) -> Result<JobOutcome, IssueError> {
    let action = Action::SkipAnalysis { reason: reason.to_owned() };
    match issue::apply_action(&ctx.pool, issue_id, &Actor::system(), &action, None).await {
        Ok(_) => Ok(JobOutcome::Skipped { reason }),
        Err(IssueError::Workflow(_)) => Ok(JobOutcome::AlreadyHandled),
        Err(e) => Err(e),
    }
}

async fn analyze_with_retry(
    ctx: &WorkerContext,
    analyzer: &dyn ImageAnalyzer,
    issue_id: Uuid,
    image_id: Uuid,
    path: &Path,
    config: WorkerConfig,
) -> Result<AnalysisReport, AnalysisError> {
    let attempts = config.retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        let (result, elapsed) = analysis::run_timed(analyzer, path).await;
        if let Err(e) =
            analysis::record_analysis(&ctx.pool, Some(issue_id), Some(image_id), &result, analyzer.model_version(), elapsed).await
        {
            warn!(%issue_id, error = %e, "failed to record analysis attempt");
        }

        match result {
            Err(e) if e.retryable() && attempt < attempts => {
                let delay = backoff_delay(attempt, config.retry_base_ms, jitter_ms(config.retry_base_ms));
                warn!(
                    %issue_id,
                    attempt,
                    total = attempts,
                    code = e.error_code(),
                    delay_ms = delay.as_millis(),
                    "analysis attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// `base * 2^(attempt-1) + jitter`, with the exponent capped so the delay
/// cannot overflow.
#[must_use]
pub fn backoff_delay(attempt: u32, base_ms: u64, jitter_ms: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    Duration::from_millis(base_ms.saturating_mul(1_u64 << exp).saturating_add(jitter_ms))
}

fn jitter_ms(base_ms: u64) -> u64 {
    if base_ms == 0 { 0 } else { rand::rng().random_range(0..base_ms) }
}

#[cfg(test)]
#[path = "analysis_worker_test.rs"]
mod tests;
