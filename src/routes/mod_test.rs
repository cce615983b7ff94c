use axum::body::Body;
use axum::http::Request;

use super::*;
use crate::routes::test_util::send;
use crate::state::test_helpers::test_app_state;

#[tokio::test]
async fn healthz_is_ok() {
    let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let (status, _) = send(test_app_state(), req).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let req = Request::builder().uri("/api/nothing-here").body(Body::empty()).unwrap();
    let (status, _) = send(test_app_state(), req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cors_preflight_is_allowed() {
    let req = Request::builder()
        .method("OPTIONS")
        .uri("/api/issues")
        .header("origin", "https://city.example")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();
    let resp = tower::ServiceExt::oneshot(app(test_app_state()), req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
}

#[test]
fn upload_error_to_status_maps_each_variant() {
    assert_eq!(upload_error_to_status(&UploadError::Empty), StatusCode::BAD_REQUEST);
    assert_eq!(upload_error_to_status(&UploadError::TooLarge { size: 2, max: 1 }), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(upload_error_to_status(&UploadError::UnsupportedType), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(upload_error_to_status(&UploadError::NameExhausted), StatusCode::INTERNAL_SERVER_ERROR);
}

#[test]
fn rate_limited_is_429_and_retryable() {
    let err = rate_limited(&RateLimitError::SubmissionsExceeded { limit: 10, window_secs: 60 });
    assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(err.code, "E_RATE_LIMIT_SUBMISSIONS");
    assert!(err.retryable);
}
