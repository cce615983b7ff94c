//! Image analysis: pothole model adapters.
//!
//! DESIGN
//! ======
//! The model itself lives outside this process. Two adapters implement
//! [`ImageAnalyzer`]:
//! - [`ScriptAnalyzer`] runs `<python> <script> <image>` and parses the JSON
//!   report the script prints on stdout.
//! - [`HttpAnalyzer`] posts the image to a model server that answers with the
//!   same JSON report.
//!
//! Both produce an [`AnalysisReport`]; everything downstream (the ad-hoc
//! endpoint, the issue worker) only sees the trait.
//!
//! ERROR HANDLING
//! ==============
//! The script is killed if it outlives its timeout. A non-zero exit, output
//! that is not a JSON object, or a JSON object carrying an `"error"` key are
//! all failures with distinct variants so logs say which one happened.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::env_parse;
use crate::services::issue::{AiFindings, Priority};

pub const DEFAULT_SCRIPT_PATH: &str = "scripts/predict_image_kaggle.py";
pub const DEFAULT_PYTHON: &str = "python";
pub const DEFAULT_ANALYZER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MODEL_VERSION: &str = "Kaggle Pothole Detector v2.0";

/// Stdout/stderr captured per stream.
const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;
/// Stderr echoed into error messages.
const MAX_STDERR_IN_ERROR: usize = 2048;

// =============================================================================
// REPORT
// =============================================================================

/// Raw classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub class: String,
    pub confidence: f64,
    pub is_pothole: bool,
    pub is_reliable: bool,
    pub severity: u8,
    #[serde(default)]
    pub raw_prediction: Vec<f64>,
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
}

/// Full analysis report as produced by the model wrapper.
///
/// Unknown keys are kept in `extra` and serialized back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub prediction: Prediction,
    /// Adjusted severity, 0 (nothing found) to 5.
    pub severity: u8,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub confidence_level: Option<String>,
    #[serde(default)]
    pub reliability: Option<String>,
    #[serde(default)]
    pub action_priority: Option<String>,
    #[serde(default)]
    pub estimated_size: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AnalysisReport {
    #[must_use]
    pub fn findings(&self) -> AiFindings {
        AiFindings {
            severity: self.severity.min(5),
            confidence: self.prediction.confidence,
            reliable: self.prediction.is_reliable,
            suggested_priority: suggested_priority(self.severity),
        }
    }
}

/// Map model severity onto an issue priority.
#[must_use]
pub fn suggested_priority(severity: u8) -> Priority {
    match severity {
        0 | 1 => Priority::Low,
        2 => Priority::Medium,
        3 => Priority::High,
        _ => Priority::Urgent,
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("image analysis is not configured")]
    NotConfigured,
    #[error("failed to start analyzer: {0}")]
    Spawn(std::io::Error),
    #[error("analysis timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("analyzer exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("analyzer output is not a valid report: {0}")]
    InvalidOutput(String),
    #[error("analyzer reported an error: {0}")]
    Reported(String),
    #[error("analyzer request failed: {0}")]
    Http(String),
    #[error("analyzer returned status {status}")]
    HttpStatus { status: u16, body: String },
    #[error("cannot read image: {0}")]
    Image(std::io::Error),
}

impl crate::error::ErrorCode for AnalysisError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotConfigured => "E_ANALYZER_DISABLED",
            Self::Spawn(_) => "E_ANALYZER_SPAWN",
            Self::Timeout { .. } => "E_ANALYZER_TIMEOUT",
            Self::Exit { .. } => "E_ANALYZER_EXIT",
            Self::InvalidOutput(_) => "E_ANALYZER_OUTPUT",
            Self::Reported(_) => "E_ANALYZER_REPORTED",
            Self::Http(_) | Self::HttpStatus { .. } => "E_ANALYZER_HTTP",
            Self::Image(_) => "E_ANALYZER_IMAGE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Http(_) | Self::HttpStatus { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// TRAIT
// =============================================================================

#[async_trait::async_trait]
pub trait ImageAnalyzer: Send + Sync {
    /// Label stored next to every analysis this adapter produces.
    fn model_version(&self) -> &str;

    async fn analyze(&self, image: &Path) -> Result<AnalysisReport, AnalysisError>;
}

/// Turn the analyzer's stdout into a report.
///
/// The model wrapper may log lines (e.g. "Model loaded from ...") before
/// the JSON document, so parsing starts at the first line beginning with `{`
/// when the whole output is not JSON.
///
/// # Errors
///
/// [`AnalysisError::Reported`] when the JSON carries an `"error"` key,
/// [`AnalysisError::InvalidOutput`] when no report can be parsed.
pub fn parse_report(stdout: &str) -> Result<AnalysisReport, AnalysisError> {
    let value = extract_json(stdout).ok_or_else(|| AnalysisError::InvalidOutput(truncate(stdout.trim(), 200)))?;
    report_from_value(value)
}

fn report_from_value(value: serde_json::Value) -> Result<AnalysisReport, AnalysisError> {
    if let Some(err) = value.get("error") {
        let msg = err.as_str().map_or_else(|| err.to_string(), str::to_owned);
        return Err(AnalysisError::Reported(msg));
    }
    serde_json::from_value(value).map_err(|e| AnalysisError::InvalidOutput(e.to_string()))
}

fn extract_json(stdout: &str) -> Option<serde_json::Value> {
    let trimmed = stdout.trim();
    if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(value);
    }
    let mut offset = 0;
    for line in stdout.split_inclusive('\n') {
        if line.trim_start().starts_with('{') {
            if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str::<serde_json::Value>(stdout[offset..].trim()) {
                return Some(value);
            }
        }
        offset += line.len();
    }
    None
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// =============================================================================
// SCRIPT ANALYZER
// =============================================================================

pub struct ScriptAnalyzer {
    program: String,
    script: PathBuf,
    working_dir: Option<PathBuf>,
    timeout: Duration,
    model_version: String,
}

impl ScriptAnalyzer {
    #[must_use]
    pub fn new(program: impl Into<String>, script: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            script: script.into(),
            working_dir: None,
            timeout,
            model_version: DEFAULT_MODEL_VERSION.to_owned(),
        }
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = version.into();
        self
    }
}

#[async_trait::async_trait]
impl ImageAnalyzer for ScriptAnalyzer {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn analyze(&self, image: &Path) -> Result<AnalysisReport, AnalysisError> {
        // The script may run in another working directory.
        let image = std::path::absolute(image).map_err(AnalysisError::Image)?;
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.script)
            .arg(&image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(AnalysisError::Spawn)?;
        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        // On timeout `child` is dropped here and `kill_on_drop` reaps it.
        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(AnalysisError::Spawn(e)),
            Err(_) => return Err(AnalysisError::Timeout { secs: self.timeout.as_secs() }),
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

        if !status.success() {
            // The wrapper prints `{"error": ...}` and exits 1 for known failures.
            if let Some(value) = extract_json(&stdout) {
                if let Some(err) = value.get("error") {
                    let msg = err.as_str().map_or_else(|| err.to_string(), str::to_owned);
                    return Err(AnalysisError::Reported(msg));
                }
            }
            return Err(AnalysisError::Exit { code: status.code(), stderr: truncate(stderr.trim(), MAX_STDERR_IN_ERROR) });
        }

        parse_report(&stdout)
    }
}

/// Keeps the first [`MAX_OUTPUT_BYTES`]. The rest is drained so the child
/// never writes into a closed pipe.
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(h) = handle else {
        return buf;
    };
    let mut capped = h.take(MAX_OUTPUT_BYTES);
    if let Err(e) = capped.read_to_end(&mut buf).await {
        debug!(error = %e, "failed to read analyzer output");
        return buf;
    }
    let mut rest = capped.into_inner();
    if let Err(e) = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await {
        debug!(error = %e, "failed to drain analyzer output");
    }
    buf
}

// =============================================================================
// HTTP ANALYZER
// =============================================================================

pub struct HttpAnalyzer {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    model_version: String,
}

impl HttpAnalyzer {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration, model_version: impl Into<String>) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnalysisError::Http(e.to_string()))?;
        Ok(Self { client, url: url.into(), timeout, model_version: model_version.into() })
    }
}

#[async_trait::async_trait]
impl ImageAnalyzer for HttpAnalyzer {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn analyze(&self, image: &Path) -> Result<AnalysisReport, AnalysisError> {
        let bytes = tokio::fs::read(image).await.map_err(AnalysisError::Image)?;
        let file_name = image
            .file_name()
            .map_or_else(|| "image".to_owned(), |n| n.to_string_lossy().into_owned());
        let form = reqwest::multipart::Form::new().part("image", reqwest::multipart::Part::bytes(bytes).file_name(file_name));

        let resp = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout { secs: self.timeout.as_secs() }
                } else {
                    AnalysisError::Http(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AnalysisError::HttpStatus { status: status.as_u16(), body: truncate(&body, 500) });
        }

        let value = resp
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AnalysisError::InvalidOutput(e.to_string()))?;
        report_from_value(value)
    }
}

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerConfig {
    Script { program: String, script: PathBuf, working_dir: Option<PathBuf>, timeout: Duration, model_version: String },
    Http { url: String, timeout: Duration, model_version: String },
}

impl AnalyzerConfig {
    /// Read analyzer settings. Returns `None` when analysis is switched off.
    ///
    /// - `ANALYZER_MODE`: `script` (default), `http` or `off`
    /// - `ANALYZER_PYTHON`: default `python`
    /// - `ANALYZER_SCRIPT`: default `scripts/predict_image_kaggle.py`
    /// - `ANALYZER_WORKDIR`: working directory for the script
    /// - `ANALYZER_URL`: model server endpoint (required for `http`)
    /// - `ANALYZER_TIMEOUT_SECS`: default 30
    /// - `ANALYZER_MODEL_VERSION`: label stored with results
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let timeout = Duration::from_secs(env_parse("ANALYZER_TIMEOUT_SECS", DEFAULT_ANALYZER_TIMEOUT_SECS));
        let model_version = std::env::var("ANALYZER_MODEL_VERSION").unwrap_or_else(|_| DEFAULT_MODEL_VERSION.to_owned());
        let mode = std::env::var("ANALYZER_MODE").unwrap_or_else(|_| "script".to_owned());
        match mode.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" => None,
            "http" => {
                let Ok(url) = std::env::var("ANALYZER_URL") else {
                    warn!("ANALYZER_MODE=http but ANALYZER_URL is unset; image analysis disabled");
                    return None;
                };
                Some(Self::Http { url, timeout, model_version })
            }
            other => {
                if other != "script" {
                    warn!(mode = other, "unknown ANALYZER_MODE; falling back to script");
                }
                Some(Self::Script {
                    program: std::env::var("ANALYZER_PYTHON").unwrap_or_else(|_| DEFAULT_PYTHON.to_owned()),
                    script: std::env::var("ANALYZER_SCRIPT")
                        .map_or_else(|_| PathBuf::from(DEFAULT_SCRIPT_PATH), PathBuf::from),
                    working_dir: std::env::var("ANALYZER_WORKDIR").ok().map(PathBuf::from),
                    timeout,
                    model_version,
                })
            }
        }
    }

    /// Build the configured adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn build(self) -> Result<Arc<dyn ImageAnalyzer>, AnalysisError> {
        match self {
            Self::Script { program, script, working_dir, timeout, model_version } => {
                let mut analyzer = ScriptAnalyzer::new(program, script, timeout).with_model_version(model_version);
                if let Some(dir) = working_dir {
                    analyzer = analyzer.with_working_dir(dir);
                }
                Ok(Arc::new(analyzer))
            }
            Self::Http { url, timeout, model_version } => Ok(Arc::new(HttpAnalyzer::new(url, timeout, model_version)?)),
        }
    }
}

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Time one analyzer call.
pub async fn run_timed(analyzer: &dyn ImageAnalyzer, image: &Path) -> (Result<AnalysisReport, AnalysisError>, Duration) {
    let started = Instant::now();
    let result = analyzer.analyze(image).await;
    let elapsed = started.elapsed();
    match &result {
        Ok(report) => info!(
            image = %image.display(),
            severity = report.severity,
            confidence = report.prediction.confidence,
            elapsed_ms = elapsed.as_millis(),
            "image analyzed"
        ),
        Err(e) => warn!(image = %image.display(), error = %e, elapsed_ms = elapsed.as_millis(), "image analysis failed"),
    }
    (result, elapsed)
}

/// Store one analysis attempt in the `analyses` table.
///
/// # Errors
///
/// Returns a database error if the insert fails.
pub async fn record_analysis(
    pool: &PgPool,
    issue_id: Option<Uuid>,
    image_id: Option<Uuid>,
    result: &Result<AnalysisReport, AnalysisError>,
    model_version: &str,
    elapsed: Duration,
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    let (outcome, report, error) = match result {
        Ok(report) => ("completed", serde_json::to_value(report).ok(), None),
        Err(e) => ("failed", None, Some(e.to_string())),
    };
    let duration_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);

    sqlx::query(
        "INSERT INTO analyses (id, issue_id, image_id, outcome, report, error, model_version, duration_ms)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(id)
    .bind(issue_id)
    .bind(image_id)
    .bind(outcome)
    .bind(report)
    .bind(error)
    .bind(model_version)
    .bind(duration_ms)
    .execute(pool)
    .await?;
    Ok(id)
}

#[cfg(test)]
#[path = "analysis_test.rs"]
mod tests;
