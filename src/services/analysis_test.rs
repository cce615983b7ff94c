use super::*;
use crate::error::ErrorCode;

const REPORT_JSON: &str = r#"{
  "prediction": {
    "class": "pothole",
    "confidence": 0.91,
    "is_pothole": true,
    "is_reliable": true,
    "severity": 4,
    "raw_prediction": [0.09, 0.91],
    "confidence_threshold": 0.7
  },
  "severity": 4,
  "recommendations": ["HIGH PRIORITY: Schedule repair within 24-48 hours"],
  "confidence_level": "High",
  "reliability": "High",
  "action_priority": "HIGH",
  "estimated_size": "Large (> 1m diameter)"
}"#;

// =============================================================================
// parse_report
// =============================================================================

#[test]
fn parse_report_reads_full_document() {
    let report = parse_report(REPORT_JSON).unwrap();
    assert_eq!(report.prediction.class, "pothole");
    assert!(report.prediction.is_pothole);
    assert_eq!(report.severity, 4);
    assert_eq!(report.recommendations.len(), 1);
    assert_eq!(report.reliability.as_deref(), Some("High"));
    assert_eq!(report.prediction.raw_prediction, vec![0.09, 0.91]);
}

#[test]
fn parse_report_skips_log_lines_before_json() {
    let stdout = format!("Model loaded from models/kaggle_pothole_detector.h5\n{REPORT_JSON}\n");
    let report = parse_report(&stdout).unwrap();
    assert_eq!(report.severity, 4);
}

#[test]
fn parse_report_surfaces_script_error() {
    let err = parse_report(r#"{"error": "Model not found. Please train the model first."}"#).unwrap_err();
    assert!(matches!(err, AnalysisError::Reported(msg) if msg.starts_with("Model not found")));
}

#[test]
fn parse_report_rejects_garbage() {
    assert!(matches!(parse_report("Segmentation fault"), Err(AnalysisError::InvalidOutput(_))));
    assert!(matches!(parse_report(""), Err(AnalysisError::InvalidOutput(_))));
    assert!(matches!(parse_report("[1, 2, 3]"), Err(AnalysisError::InvalidOutput(_))));
}

#[test]
fn parse_report_rejects_object_without_prediction() {
    let err = parse_report(r#"{"severity": 2}"#).unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidOutput(_)));
}

#[test]
fn parse_report_keeps_unknown_fields() {
    let json = r#"{"prediction":{"class":"no_pothole","confidence":0.8,"is_pothole":false,"is_reliable":true,"severity":0},"severity":0,"model_notes":"v2"}"#;
    let report = parse_report(json).unwrap();
    assert_eq!(report.extra.get("model_notes").and_then(|v| v.as_str()), Some("v2"));
    let back = serde_json::to_value(&report).unwrap();
    assert_eq!(back["model_notes"], "v2");
}

// =============================================================================
// severity mapping
// =============================================================================

#[test]
fn suggested_priority_by_severity() {
    assert_eq!(suggested_priority(0), Priority::Low);
    assert_eq!(suggested_priority(1), Priority::Low);
    assert_eq!(suggested_priority(2), Priority::Medium);
    assert_eq!(suggested_priority(3), Priority::High);
    assert_eq!(suggested_priority(4), Priority::Urgent);
    assert_eq!(suggested_priority(5), Priority::Urgent);
}

#[test]
fn findings_clamp_severity() {
    let mut report = parse_report(REPORT_JSON).unwrap();
    report.severity = 9;
    let findings = report.findings();
    assert_eq!(findings.severity, 5);
    assert!(findings.reliable);
    assert_eq!(findings.suggested_priority, Priority::Urgent);
}

#[test]
fn retryable_errors() {
    assert!(AnalysisError::Timeout { secs: 30 }.retryable());
    assert!(AnalysisError::HttpStatus { status: 503, body: String::new() }.retryable());
    assert!(!AnalysisError::HttpStatus { status: 400, body: String::new() }.retryable());
    assert!(!AnalysisError::Reported("x".into()).retryable());
    assert_eq!(AnalysisError::Exit { code: Some(1), stderr: String::new() }.error_code(), "E_ANALYZER_EXIT");
}

// =============================================================================
// ScriptAnalyzer
// =============================================================================

#[cfg(unix)]
async fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("predict.sh");
    tokio::fs::write(&path, body).await.unwrap();
    path
}

#[cfg(unix)]
#[tokio::test]
async fn script_analyzer_parses_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("echo 'Model loaded from models/x.h5'\ncat <<'EOF'\n{REPORT_JSON}\nEOF\n");
    let path = script(&dir, &body).await;
    let analyzer = ScriptAnalyzer::new("sh", path, Duration::from_secs(5));

    let report = analyzer.analyze(Path::new("/tmp/image.jpg")).await.unwrap();
    assert_eq!(report.severity, 4);
    assert_eq!(analyzer.model_version(), DEFAULT_MODEL_VERSION);
}

#[cfg(unix)]
#[tokio::test]
async fn script_analyzer_passes_image_path() {
    let dir = tempfile::tempdir().unwrap();
    let body = r#"printf '{"prediction":{"class":"%s","confidence":0.5,"is_pothole":false,"is_reliable":false,"severity":0},"severity":0}' "$1""#;
    let path = script(&dir, body).await;
    let analyzer = ScriptAnalyzer::new("sh", path, Duration::from_secs(5));

    let report = analyzer.analyze(Path::new("road.jpg")).await.unwrap();
    let passed = PathBuf::from(&report.prediction.class);
    assert!(passed.is_absolute());
    assert!(passed.ends_with("road.jpg"));
}

#[cfg(unix)]
#[tokio::test]
async fn script_analyzer_finds_relative_upload_from_other_workdir() {
    let uploads = tempfile::tempdir_in(".").unwrap();
    let name = uploads.path().file_name().unwrap();
    let relative = PathBuf::from(name).join("road.png");
    tokio::fs::write(&relative, b"\x89PNG\r\n\x1a\n").await.unwrap();

    let scripts = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();
    let body = format!(
        "if [ -f \"$1\" ]; then\ncat <<'EOF'\n{REPORT_JSON}\nEOF\nelse\necho \"{{\\\"error\\\": \\\"Could not load image: $1\\\"}}\"\nexit 1\nfi\n"
    );
    let path = script(&scripts, &body).await;
    let analyzer = ScriptAnalyzer::new("sh", path, Duration::from_secs(5)).with_working_dir(workdir.path());

    let report = analyzer.analyze(&relative).await.unwrap();
    assert_eq!(report.severity, 4);
}

#[cfg(unix)]
#[tokio::test]
async fn script_analyzer_survives_large_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("head -c 3000000 /dev/zero >&2\ncat <<'EOF'\n{REPORT_JSON}\nEOF\n");
    let path = script(&dir, &body).await;
    let analyzer = ScriptAnalyzer::new("sh", path, Duration::from_secs(10));

    let report = analyzer.analyze(Path::new("x.jpg")).await.unwrap();
    assert_eq!(report.severity, 4);
}

#[cfg(unix)]
#[tokio::test]
async fn script_analyzer_reports_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "echo 'Traceback: boom' >&2\nexit 3\n").await;
    let analyzer = ScriptAnalyzer::new("sh", path, Duration::from_secs(5));

    let err = analyzer.analyze(Path::new("x.jpg")).await.unwrap_err();
    match err {
        AnalysisError::Exit { code, stderr } => {
            assert_eq!(code, Some(3));
            assert!(stderr.contains("boom"));
        }
        other => panic!("expected exit error, got {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn script_analyzer_prefers_reported_error_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "echo '{\"error\": \"Failed to load model\"}'\nexit 1\n").await;
    let analyzer = ScriptAnalyzer::new("sh", path, Duration::from_secs(5));

    let err = analyzer.analyze(Path::new("x.jpg")).await.unwrap_err();
    assert!(matches!(err, AnalysisError::Reported(msg) if msg == "Failed to load model"));
}

#[cfg(unix)]
#[tokio::test]
async fn script_analyzer_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "sleep 5\n").await;
    let analyzer = ScriptAnalyzer::new("sh", path, Duration::from_millis(200));

    let started = Instant::now();
    let err = analyzer.analyze(Path::new("x.jpg")).await.unwrap_err();
    assert!(matches!(err, AnalysisError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn script_analyzer_missing_program_is_spawn_error() {
    let analyzer = ScriptAnalyzer::new("/definitely/not/a/python", "predict.py", Duration::from_secs(1));
    let err = analyzer.analyze(Path::new("x.jpg")).await.unwrap_err();
    assert!(matches!(err, AnalysisError::Spawn(_)));
}

// =============================================================================
// AnalyzerConfig
// =============================================================================

#[test]
fn analyzer_config_builds_script_adapter() {
    let cfg = AnalyzerConfig::Script {
        program: "python3".into(),
        script: PathBuf::from("scripts/predict.py"),
        working_dir: None,
        timeout: Duration::from_secs(10),
        model_version: "test-model".into(),
    };
    let analyzer = cfg.build().unwrap();
    assert_eq!(analyzer.model_version(), "test-model");
}

// =============================================================================
// HttpAnalyzer
// =============================================================================

async fn model_server(status: axum::http::StatusCode, body: &'static str) -> String {
    let app = axum::Router::new().route(
        "/predict",
        axum::routing::post(move |_image: axum::body::Bytes| async move { (status, body) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/predict")
}

async fn http_analyze(status: axum::http::StatusCode, body: &'static str) -> Result<AnalysisReport, AnalysisError> {
    let url = model_server(status, body).await;
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("road.jpg");
    tokio::fs::write(&image, [0xFF, 0xD8, 0xFF, 0xE0]).await.unwrap();
    let analyzer = HttpAnalyzer::new(url, Duration::from_secs(5), "remote-model").unwrap();
    analyzer.analyze(&image).await
}

#[tokio::test]
async fn http_analyzer_parses_report() {
    let report = http_analyze(axum::http::StatusCode::OK, REPORT_JSON).await.unwrap();
    assert_eq!(report.prediction.class, "pothole");
    assert_eq!(report.severity, 4);
}

#[tokio::test]
async fn http_analyzer_unavailable_is_retryable() {
    let err = http_analyze(axum::http::StatusCode::SERVICE_UNAVAILABLE, "model warming up")
        .await
        .unwrap_err();
    assert!(matches!(&err, AnalysisError::HttpStatus { status: 503, body } if body == "model warming up"));
    assert!(err.retryable());
}

#[tokio::test]
async fn http_analyzer_surfaces_reported_error() {
    let err = http_analyze(axum::http::StatusCode::OK, r#"{"error": "Could not load image"}"#)
        .await
        .unwrap_err();
    assert!(matches!(&err, AnalysisError::Reported(msg) if msg == "Could not load image"));
    assert!(!err.retryable());
}

#[tokio::test]
async fn http_analyzer_rejects_non_json_body() {
    let err = http_analyze(axum::http::StatusCode::OK, "<html>oops</html>").await.unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidOutput(_)));
}

#[tokio::test]
async fn http_analyzer_missing_image_is_image_error() {
    let analyzer = HttpAnalyzer::new("http://127.0.0.1:9/predict", Duration::from_secs(1), "m").unwrap();
    let err = analyzer.analyze(Path::new("/definitely/missing.jpg")).await.unwrap_err();
    assert!(matches!(err, AnalysisError::Image(_)));
}
