//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the database pool, the optional image analyzer, upload settings,
//! the in-memory rate limiter and the sender side of the analysis queue.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{DEFAULT_TECHNICIAN_MAX_OPEN, UploadConfig};
use crate::rate_limit::RateLimiter;
use crate::services::analysis::ImageAnalyzer;
use crate::services::analysis_worker::WorkerContext;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    /// Optional image analyzer. `None` when `ANALYZER_MODE=off`.
    pub analyzer: Option<Arc<dyn ImageAnalyzer>>,
    pub uploads: UploadConfig,
    pub rate_limiter: RateLimiter,
    /// Analysis queue. `None` until workers are spawned (and in tests).
    pub analysis_tx: Option<mpsc::Sender<Uuid>>,
    pub technician_max_open: i64,
}

impl AppState {
    #[must_use]
    pub fn new(pool: PgPool, analyzer: Option<Arc<dyn ImageAnalyzer>>, uploads: UploadConfig) -> Self {
        Self {
            pool,
            analyzer,
            uploads,
            rate_limiter: RateLimiter::new(),
            analysis_tx: None,
            technician_max_open: DEFAULT_TECHNICIAN_MAX_OPEN,
        }
    }

    #[must_use]
    pub fn with_analysis_queue(mut self, tx: mpsc::Sender<Uuid>) -> Self {
        self.analysis_tx = Some(tx);
        self
    }

    #[must_use]
    pub fn with_technician_max_open(mut self, max_open: i64) -> Self {
        self.technician_max_open = max_open;
        self
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// The subset of state the analysis workers run with.
    #[must_use]
    pub fn worker_context(&self) -> WorkerContext {
        WorkerContext { pool: self.pool.clone(), analyzer: self.analyzer.clone(), uploads: self.uploads.clone() }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
