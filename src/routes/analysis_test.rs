use std::path::Path;
use std::sync::Arc;

use super::*;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::routes::test_util::{multipart_request, send};
use crate::services::analysis::{ImageAnalyzer, parse_report};
use crate::state::test_helpers::{test_app_state, test_app_state_with_analyzer};

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
const REPORT: &str = r#"{"prediction":{"class":"pothole","confidence":0.88,"is_pothole":true,"is_reliable":true,"severity":4},"severity":4,"recommendations":["Schedule repair"]}"#;

struct MockAnalyzer {
    fail: bool,
}

#[async_trait::async_trait]
impl ImageAnalyzer for MockAnalyzer {
    fn model_version(&self) -> &str {
        "mock-detector"
    }

    async fn analyze(&self, image: &Path) -> Result<AnalysisReport, AnalysisError> {
        assert!(image.exists(), "analyzer should see the stored file");
        if self.fail {
            return Err(AnalysisError::Reported("model crashed".into()));
        }
        parse_report(REPORT)
    }
}

fn analyzer(fail: bool) -> Arc<dyn ImageAnalyzer> {
    Arc::new(MockAnalyzer { fail })
}

#[test]
fn analysis_error_to_status_maps_disabled_to_503() {
    assert_eq!(analysis_error_to_status(&AnalysisError::NotConfigured), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(analysis_error_to_status(&AnalysisError::Timeout { secs: 30 }), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn analyse_image_returns_report() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_app_state_with_analyzer(analyzer(false), tmp.path());
    let req = multipart_request("/api/ai/analyse-image", None, "image", "road.png", PNG);

    let (status, body) = send(state, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["model_version"], "mock-detector");
    assert_eq!(body["analysis"]["severity"], 4);
    assert_eq!(body["analysis"]["prediction"]["class"], "pothole");
    let filename = body["filename"].as_str().unwrap();
    assert!(filename.ends_with("-road.png"), "{filename}");
    assert!(tmp.path().join(filename).exists());
}

#[tokio::test]
async fn analyse_image_without_image_field_is_400() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_app_state_with_analyzer(analyzer(false), tmp.path());
    let req = multipart_request("/api/ai/analyse-image", None, "photo", "road.png", PNG);

    let (status, body) = send(state, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No image provided");
}

#[tokio::test]
async fn analyzer_failure_is_500_with_details() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_app_state_with_analyzer(analyzer(true), tmp.path());
    let req = multipart_request("/api/ai/analyse-image", None, "image", "road.png", PNG);

    let (status, body) = send(state, req).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to analyze image");
    assert!(body["details"].as_str().unwrap().contains("model crashed"));
}

#[tokio::test]
async fn missing_analyzer_is_503() {
    let req = multipart_request("/api/ai/analyse-image", None, "image", "road.png", PNG);
    let (status, body) = send(test_app_state(), req).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "E_ANALYZER_DISABLED");
}

#[tokio::test]
async fn non_image_upload_is_415() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_app_state_with_analyzer(analyzer(false), tmp.path());
    let req = multipart_request("/api/ai/analyse-image", None, "image", "notes.txt", b"hello there");

    let (status, body) = send(state, req).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["code"], "E_UPLOAD_TYPE");
}

#[tokio::test]
async fn oversize_upload_is_413() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_app_state_with_analyzer(analyzer(false), tmp.path());
    let mut big = PNG.to_vec();
    big.resize(state.uploads.max_bytes + 1, 0);
    let req = multipart_request("/api/ai/analyse-image", None, "image", "big.png", &big);

    let (status, _) = send(state, req).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn analysis_rate_limit_is_429() {
    let tmp = tempfile::tempdir().unwrap();
    let limiter = RateLimiter::with_config(RateLimitConfig { analysis_limit: 1, ..RateLimitConfig::default() });
    let state = test_app_state_with_analyzer(analyzer(false), tmp.path()).with_rate_limiter(limiter);

    let first = multipart_request("/api/ai/analyse-image", None, "image", "a.png", PNG);
    assert_eq!(send(state.clone(), first).await.0, StatusCode::OK);

    let second = multipart_request("/api/ai/analyse-image", None, "image", "b.png", PNG);
    let (status, body) = send(state, second).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["retryable"], true);
}

#[tokio::test]
async fn rejected_uploads_do_not_spend_analysis_budget() {
    let tmp = tempfile::tempdir().unwrap();
    let limiter = RateLimiter::with_config(RateLimitConfig { analysis_limit: 1, ..RateLimitConfig::default() });
    let state = test_app_state_with_analyzer(analyzer(false), tmp.path()).with_rate_limiter(limiter);

    let no_image = multipart_request("/api/ai/analyse-image", None, "photo", "a.png", PNG);
    assert_eq!(send(state.clone(), no_image).await.0, StatusCode::BAD_REQUEST);

    let text = multipart_request("/api/ai/analyse-image", None, "image", "notes.txt", b"hello there");
    assert_eq!(send(state.clone(), text).await.0, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let valid = multipart_request("/api/ai/analyse-image", None, "image", "b.png", PNG);
    assert_eq!(send(state, valid).await.0, StatusCode::OK);
}
