use serde_json::json;
use time::OffsetDateTime;

use super::*;
use crate::routes::test_util::{json_request, multipart_request, send};
use crate::services::directory::User;
use crate::state::test_helpers::test_app_state;

// =============================================================================
// error mapping
// =============================================================================

#[tokio::test]
async fn duplicate_lookup_failure_yields_no_refs() {
    let state = test_app_state();
    let refs = duplicate_refs(&state.pool, Uuid::new_v4(), "deadbeef").await;
    assert!(refs.is_empty());
}

#[test]
fn issue_error_to_status_maps_not_found() {
    assert_eq!(issue_error_to_status(&IssueError::NotFound(Uuid::nil())), StatusCode::NOT_FOUND);
}

#[test]
fn issue_error_to_status_maps_conflicts() {
    let stale = IssueError::VersionConflict { expected: 2, actual: 3 };
    assert_eq!(issue_error_to_status(&stale), StatusCode::CONFLICT);

    let illegal = IssueError::Workflow(WorkflowError::InvalidTransition {
        from: IssueStatus::Resolved,
        action: ActionKind::Approve,
    });
    assert_eq!(issue_error_to_status(&illegal), StatusCode::CONFLICT);
}

#[test]
fn issue_error_to_status_maps_forbidden() {
    let err = IssueError::Workflow(WorkflowError::Forbidden { role: Role::Citizen, action: ActionKind::Approve });
    assert_eq!(issue_error_to_status(&err), StatusCode::FORBIDDEN);
}

#[test]
fn issue_error_to_status_maps_payload_problems() {
    for err in [
        IssueError::Validation("title".into()),
        IssueError::SectorNotFound(Uuid::nil()),
        IssueError::NotATechnician(Uuid::nil()),
        IssueError::Workflow(WorkflowError::MissingField { action: ActionKind::Reject, field: "reason" }),
    ] {
        assert_eq!(issue_error_to_status(&err), StatusCode::UNPROCESSABLE_ENTITY, "{err}");
    }
}

#[test]
fn version_conflict_body_is_retryable() {
    let err = issue_error(IssueError::VersionConflict { expected: 1, actual: 2 });
    assert_eq!(err.code, "E_VERSION_CONFLICT");
    assert!(err.retryable);
}

// =============================================================================
// query parsing
// =============================================================================

#[test]
fn issue_filter_parses_enums() {
    let query = IssueQuery {
        status: Some("in_progress".into()),
        category: Some("roads".into()),
        priority: Some("urgent".into()),
        guest: Some(true),
        q: Some("pothole".into()),
        ..IssueQuery::default()
    };
    let filter = issue_filter(query).unwrap();
    assert_eq!(filter.status, Some(IssueStatus::InProgress));
    assert_eq!(filter.category, Some(Category::Roads));
    assert_eq!(filter.priority, Some(Priority::Urgent));
    assert_eq!(filter.is_guest_report, Some(true));
    assert_eq!(filter.query.as_deref(), Some("pothole"));
}

#[test]
fn issue_filter_ignores_blank_values() {
    let filter = issue_filter(IssueQuery { status: Some("  ".into()), ..IssueQuery::default() }).unwrap();
    assert_eq!(filter.status, None);
}

#[test]
fn issue_filter_rejects_unknown_status() {
    let err = issue_filter(IssueQuery { status: Some("closed".into()), ..IssueQuery::default() }).unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
    assert!(err.message.contains("closed"));
}

// =============================================================================
// request bodies
// =============================================================================

#[test]
fn action_request_flattens_action_and_version() {
    let body: ActionRequest =
        serde_json::from_value(json!({"action": "reject", "reason": "duplicate", "expected_version": 4})).unwrap();
    assert_eq!(body.action, Action::Reject { reason: "duplicate".into() });
    assert_eq!(body.expected_version, Some(4));
}

#[test]
fn action_request_version_is_optional() {
    let body: ActionRequest = serde_json::from_value(json!({"action": "start_work"})).unwrap();
    assert_eq!(body.action, Action::StartWork);
    assert_eq!(body.expected_version, None);
}

#[test]
fn action_request_rejects_unknown_action() {
    assert!(serde_json::from_value::<ActionRequest>(json!({"action": "teleport"})).is_err());
}

// =============================================================================
// photo permissions
// =============================================================================

fn caller(role: Role) -> CurrentUser {
    CurrentUser {
        user: User {
            id: Uuid::new_v4(),
            name: "Caller".into(),
            role,
            home_sector_id: None,
            specialization: None,
            created_at: OffsetDateTime::now_utc(),
        },
    }
}

fn issue_reported_by(reporter_id: Uuid) -> Issue {
    let now = OffsetDateTime::now_utc();
    Issue {
        id: Uuid::new_v4(),
        reference: "ISSUE-1".into(),
        title: "Broken light".into(),
        description: "The streetlight has been out for a week now.".into(),
        category: Category::Streetlight,
        priority: Priority::Medium,
        location: "Elm Street".into(),
        latitude: None,
        longitude: None,
        sector_id: Uuid::new_v4(),
        reporter_id,
        is_guest_report: false,
        status: IssueStatus::Submitted,
        version: 1,
        assigned_technician_id: None,
        due_at: None,
        ai_severity: None,
        ai_confidence: None,
        ai_reliable: None,
        created_at: now,
        updated_at: now,
        resolved_at: None,
    }
}

#[test]
fn reporter_may_attach_to_own_issue() {
    let me = caller(Role::Citizen);
    assert!(may_attach(&me, &issue_reported_by(me.user.id)).is_ok());
}

#[test]
fn other_citizens_may_not_attach() {
    let err = may_attach(&caller(Role::Citizen), &issue_reported_by(Uuid::new_v4())).unwrap_err();
    assert_eq!(err.status, StatusCode::FORBIDDEN);
}

#[test]
fn staff_may_attach_anywhere() {
    assert!(may_attach(&caller(Role::Moderator), &issue_reported_by(Uuid::new_v4())).is_ok());
}

// =============================================================================
// router
// =============================================================================

#[tokio::test]
async fn create_issue_requires_actor() {
    let req = json_request("POST", "/api/issues", None, &json!({}));
    let (status, body) = send(test_app_state(), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "E_UNAUTHORIZED");
}

#[tokio::test]
async fn malformed_actor_header_is_unauthorized() {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(format!("/api/issues/{}/actions", Uuid::new_v4()))
        .header("x-user-id", "nope")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(r#"{"action":"start_work"}"#))
        .unwrap();
    let (status, _) = send(test_app_state(), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn list_issues_rejects_unknown_category() {
    let req = json_request("GET", "/api/issues?category=volcano", None, &json!(null));
    let (status, body) = send(test_app_state(), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "E_BAD_REQUEST");
}

#[tokio::test]
async fn upload_without_actor_is_unauthorized() {
    let uri = format!("/api/issues/{}/images", Uuid::new_v4());
    let req = multipart_request(&uri, None, "image", "a.png", b"\x89PNG\r\n\x1a\n");
    let (status, _) = send(test_app_state(), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn get_issue_with_bad_id_is_bad_request() {
    let req = json_request("GET", "/api/issues/not-a-uuid", None, &json!(null));
    let (status, _) = send(test_app_state(), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// =============================================================================
// live database
// =============================================================================

#[cfg(feature = "live-db-tests")]
mod live {
    use super::*;
    use crate::db::test_support::{integration_pool, seed_sector, seed_user};
    use crate::state::AppState;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3, 4];

    fn new_issue(sector: Uuid) -> serde_json::Value {
        json!({
            "title": "Overflowing bins",
            "description": "Bins at the market square have not been emptied for days.",
            "category": "garbage",
            "location": "Market Square",
            "sector_id": sector,
        })
    }

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL/live Postgres"]
    async fn submit_upload_and_walk_workflow() {
        let pool = integration_pool().await;
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let state = AppState::new(pool.clone(), None, crate::config::UploadConfig { dir: tmp.path().to_path_buf(), max_bytes: 1024 })
            .with_analysis_queue(tx);

        let sector = seed_sector(&pool, "RT").await;
        let citizen = seed_user(&pool, Role::Citizen, Some(sector)).await;
        let moderator = seed_user(&pool, Role::Moderator, Some(sector)).await;

        let (status, created) = send(state.clone(), json_request("POST", "/api/issues", Some(citizen), &new_issue(sector))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "submitted");
        let issue_id: Uuid = created["id"].as_str().unwrap().parse().unwrap();

        let uri = format!("/api/issues/{issue_id}/images");
        let (status, uploaded) = send(state.clone(), multipart_request(&uri, Some(citizen), "image", "bins.png", PNG)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(uploaded["queued"], true);
        assert_eq!(rx.recv().await, Some(issue_id));

        let uri = format!("/api/issues/{issue_id}/actions");
        let skip = json!({"action": "skip_analysis", "reason": "manual review", "expected_version": 1});
        let (status, applied) = send(state.clone(), json_request("POST", &uri, Some(moderator), &skip)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(applied["issue"]["status"], "verification");

        let stale = json!({"action": "verify", "expected_version": 1});
        let (status, body) = send(state.clone(), json_request("POST", &uri, Some(moderator), &stale)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["retryable"], true);

        let (status, allowed) = send(state.clone(), json_request("GET", &uri, Some(citizen), &json!(null))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(allowed["actions"], json!([]));

        let uri = format!("/api/issues/{issue_id}");
        let (status, detail) = send(state, json_request("GET", &uri, None, &json!(null))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["images"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL/live Postgres"]
    async fn unknown_actor_is_unauthorized() {
        let pool = integration_pool().await;
        let state = AppState::new(pool, None, crate::config::UploadConfig::default());
        let sector = Uuid::new_v4();
        let req = json_request("POST", "/api/issues", Some(Uuid::new_v4()), &new_issue(sector));
        let (status, _) = send(state, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
