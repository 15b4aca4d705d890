use std::sync::Arc;

use accessbot_contracts::{AccessRequest, RequestState, StateUpdate};
use accessbot_kernel::PostedMessage;
use accessbot_runtime::{
    build_app, get_access_request, AccessRequestAuthority, AppState, MemoryAuthority,
    MessageCache, Readiness,
};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt;

struct TestApp {
    app: Router,
    authority: Arc<MemoryAuthority>,
    cache: Arc<MessageCache>,
}

fn test_app(ready: bool) -> TestApp {
    let authority = Arc::new(MemoryAuthority::new());
    let cache = Arc::new(MessageCache::new(60));
    let app = build_app(AppState::new(
        authority.clone(),
        cache.clone(),
        Readiness::fixed(ready),
    ));
    TestApp {
        app,
        authority,
        cache,
    }
}

async fn pending(authority: &MemoryAuthority) -> AccessRequest {
    authority
        .create_access_request(AccessRequest::pending("alice", vec!["admin".to_string()]))
        .await
        .unwrap()
}

async fn post_review(app: &Router, id: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/requests/{id}/review"))
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn get_status(app: &Router, uri: &str) -> StatusCode {
    app.clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn healthz_ok() {
    let t = test_app(false);
    assert_eq!(get_status(&t.app, "/v1/healthz").await, StatusCode::OK);
}

#[tokio::test]
async fn ready_follows_the_job() {
    assert_eq!(
        get_status(&test_app(false).app, "/v1/ready").await,
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(
        get_status(&test_app(true).app, "/v1/ready").await,
        StatusCode::OK
    );
}

#[tokio::test]
async fn approve_cached_request() {
    let t = test_app(true);
    let req = pending(&t.authority).await;
    announced(&t, &req);

    let (status, body) = post_review(
        &t.app,
        &req.id,
        json!({"action": "approve", "reviewer": "bob", "reason": "on call"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "approved");
    assert_eq!(body["request_id"], req.id.as_str());

    let stored = get_access_request(t.authority.as_ref(), &req.id)
        .await
        .unwrap();
    assert_eq!(stored.state, RequestState::Approved);
    assert_eq!(stored.resolve_reason, "on call");
    assert_eq!(
        stored.resolve_annotations["delegator"],
        vec!["bob".to_string()]
    );
    assert!(t.cache.get(&req.id).unwrap().is_none());
}

#[tokio::test]
async fn cache_miss_falls_back_to_the_authority() {
    let t = test_app(true);
    let req = pending(&t.authority).await;

    let (status, body) = post_review(
        &t.app,
        &req.id,
        json!({"action": "deny", "reviewer": "bob"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "denied");
}

#[tokio::test]
async fn unknown_request_is_expired() {
    let t = test_app(true);
    let (status, body) = post_review(
        &t.app,
        "does-not-exist",
        json!({"action": "approve", "reviewer": "bob"}),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"]["code"], "request_expired");
}

#[tokio::test]
async fn resolved_request_conflicts() {
    let t = test_app(true);
    let req = pending(&t.authority).await;
    let (status, _) = post_review(
        &t.app,
        &req.id,
        json!({"action": "approve", "reviewer": "bob"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_review(
        &t.app,
        &req.id,
        json!({"action": "deny", "reviewer": "carol"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_resolved");
}

fn announced(t: &TestApp, req: &AccessRequest) {
    t.cache
        .put(
            req.clone(),
            vec![PostedMessage {
                channel_id: "C1".to_string(),
                message_id: "1".to_string(),
            }],
        )
        .unwrap();
}

#[tokio::test]
async fn stale_cached_request_conflicts() {
    let t = test_app(true);
    let req = pending(&t.authority).await;
    announced(&t, &req);
    t.authority
        .set_access_request_state(
            &req.id,
            StateUpdate {
                state: RequestState::Approved,
                delegator: "bob".to_string(),
                reason: String::new(),
            },
        )
        .await
        .unwrap();

    let (status, body) = post_review(
        &t.app,
        &req.id,
        json!({"action": "deny", "reviewer": "carol"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_resolved");
    let stored = get_access_request(t.authority.as_ref(), &req.id)
        .await
        .unwrap();
    assert_eq!(stored.state, RequestState::Approved);
}

#[tokio::test]
async fn failed_review_keeps_the_cached_messages() {
    let t = test_app(true);
    let req = pending(&t.authority).await;
    announced(&t, &req);
    t.authority.delete_access_request(&req.id).await.unwrap();

    let (status, body) = post_review(
        &t.app,
        &req.id,
        json!({"action": "approve", "reviewer": "bob"}),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"]["code"], "request_expired");
    let cached = t.cache.get(&req.id).unwrap().unwrap();
    assert_eq!(cached.locator[0].message_id, "1");
}

#[tokio::test]
async fn invalid_review_is_rejected() {
    let t = test_app(true);
    let req = pending(&t.authority).await;

    let (status, body) = post_review(
        &t.app,
        &req.id,
        json!({"action": "escalate", "reviewer": "bob"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, body) = post_review(
        &t.app,
        &req.id,
        json!({"action": "approve", "reviewer": "  "}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");

    let stored = get_access_request(t.authority.as_ref(), &req.id)
        .await
        .unwrap();
    assert_eq!(stored.state, RequestState::Pending);
}

#[tokio::test]
async fn closed_cache_is_unavailable() {
    let t = test_app(true);
    let req = pending(&t.authority).await;
    t.cache.close();

    let (status, body) = post_review(
        &t.app,
        &req.id,
        json!({"action": "approve", "reviewer": "bob"}),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "shutting_down");
}
