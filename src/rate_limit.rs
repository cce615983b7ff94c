//! In-memory rate limiting for issue submission and ad-hoc analysis.
//!
//! DESIGN
//! ======
//! Sliding-window counters backed by `VecDeque<Instant>`. Two limits:
//! - Per-user: 10 issue submissions/min
//! - Global: 20 synchronous image analyses/min (the analyse-image endpoint
//!   spawns one model process per call)
//!
//! State is per process; a multi-instance deployment gets one budget per
//! instance.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::env_parse;

const DEFAULT_SUBMISSION_LIMIT: usize = 10;
const DEFAULT_SUBMISSION_WINDOW_SECS: u64 = 60;

const DEFAULT_ANALYSIS_LIMIT: usize = 20;
const DEFAULT_ANALYSIS_WINDOW_SECS: u64 = 60;

/// Per-user map size above which users with no recent submissions are dropped.
const IDLE_SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub submission_limit: usize,
    pub submission_window: Duration,
    pub analysis_limit: usize,
    pub analysis_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            submission_limit: DEFAULT_SUBMISSION_LIMIT,
            submission_window: Duration::from_secs(DEFAULT_SUBMISSION_WINDOW_SECS),
            analysis_limit: DEFAULT_ANALYSIS_LIMIT,
            analysis_window: Duration::from_secs(DEFAULT_ANALYSIS_WINDOW_SECS),
        }
    }
}

impl RateLimitConfig {
    /// - `RATE_LIMIT_SUBMISSIONS` / `RATE_LIMIT_SUBMISSIONS_WINDOW_SECS`
    /// - `RATE_LIMIT_ANALYSES` / `RATE_LIMIT_ANALYSES_WINDOW_SECS`
    #[must_use]
    pub fn from_env() -> Self {
        let submission_window_secs = env_parse("RATE_LIMIT_SUBMISSIONS_WINDOW_SECS", DEFAULT_SUBMISSION_WINDOW_SECS);
        let analysis_window_secs = env_parse("RATE_LIMIT_ANALYSES_WINDOW_SECS", DEFAULT_ANALYSIS_WINDOW_SECS);

        Self {
            submission_limit: env_parse("RATE_LIMIT_SUBMISSIONS", DEFAULT_SUBMISSION_LIMIT),
            submission_window: Duration::from_secs(submission_window_secs),
            analysis_limit: env_parse("RATE_LIMIT_ANALYSES", DEFAULT_ANALYSIS_LIMIT),
            analysis_window: Duration::from_secs(analysis_window_secs),
        }
    }
}

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error)]
#[allow(clippy::enum_variant_names)]
pub enum RateLimitError {
    #[error("submission rate limit exceeded (max {limit} issues/{window_secs}s)")]
    SubmissionsExceeded { limit: usize, window_secs: u64 },
    #[error("analysis rate limit exceeded (max {limit} requests/{window_secs}s)")]
    AnalysesExceeded { limit: usize, window_secs: u64 },
}

impl crate::error::ErrorCode for RateLimitError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::SubmissionsExceeded { .. } => "E_RATE_LIMIT_SUBMISSIONS",
            Self::AnalysesExceeded { .. } => "E_RATE_LIMIT_ANALYSES",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

// =============================================================================
// RATE LIMITER
// =============================================================================

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<RateLimiterInner>>,
    config: RateLimitConfig,
}

#[derive(Default)]
struct RateLimiterInner {
    /// Per-user submission timestamps.
    submissions: HashMap<Uuid, VecDeque<Instant>>,
    /// Global analysis timestamps.
    analyses: VecDeque<Instant>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RateLimitConfig::from_env())
    }

    #[must_use]
    pub fn with_config(config: RateLimitConfig) -> Self {
        Self { inner: Arc::new(Mutex::new(RateLimiterInner::default())), config }
    }

    /// Check the per-user submission limit, then record the submission.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::SubmissionsExceeded`] when the user is over
    /// the limit. Nothing is recorded in that case.
    pub fn check_submission(&self, user_id: Uuid) -> Result<(), RateLimitError> {
        self.check_submission_at(user_id, Instant::now())
    }

    fn check_submission_at(&self, user_id: Uuid, now: Instant) -> Result<(), RateLimitError> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let cfg = self.config;

        if inner.submissions.len() > IDLE_SWEEP_THRESHOLD {
            inner.submissions.retain(|_, deque| {
                prune_window(deque, now, cfg.submission_window);
                !deque.is_empty()
            });
        }

        let deque = inner.submissions.entry(user_id).or_default();
        prune_window(deque, now, cfg.submission_window);
        if deque.len() >= cfg.submission_limit {
            return Err(RateLimitError::SubmissionsExceeded {
                limit: cfg.submission_limit,
                window_secs: cfg.submission_window.as_secs(),
            });
        }
        deque.push_back(now);
        Ok(())
    }

    /// Check the global analysis limit, then record the request.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::AnalysesExceeded`] when the limit is hit.
    pub fn check_analysis(&self) -> Result<(), RateLimitError> {
        self.check_analysis_at(Instant::now())
    }

    fn check_analysis_at(&self, now: Instant) -> Result<(), RateLimitError> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let cfg = self.config;

        prune_window(&mut inner.analyses, now, cfg.analysis_window);
        if inner.analyses.len() >= cfg.analysis_limit {
            return Err(RateLimitError::AnalysesExceeded {
                limit: cfg.analysis_limit,
                window_secs: cfg.analysis_window.as_secs(),
            });
        }
        inner.analyses.push_back(now);
        Ok(())
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).submissions.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn prune_window(deque: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = deque.front() {
        if now.duration_since(front) > window {
            deque.pop_front();
        } else {
            break;
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "rate_limit_test.rs"]
mod tests;
