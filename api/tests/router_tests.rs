//! Smoke tests through the HTTP layer.

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use common::{admin, user, TestDb};
use http_body_util::BodyExt;
use scholia_api::{auth, router, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

const SECRET: &str = "test-secret";

fn app(db: &TestDb) -> Router {
    let state = AppState {
        db: db.pool.clone(),
        jwt_secret: SECRET.to_string(),
    };
    router(state, "http://localhost:1313").unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_health() {
    let db = TestDb::new();
    let response = app(&db).oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn test_posting_requires_a_token() {
    let db = TestDb::new();
    let (status, body) = send(
        app(&db),
        post_json(
            "/api/forum/threads",
            None,
            json!({"category_id": 1, "title": "Hi", "content": "there"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn test_thread_round_trip() {
    let db = TestDb::new();
    let alice = user(&db.conn(), "alice");
    let token = auth::issue_token(alice, SECRET, 3600).unwrap();

    let (status, created) = send(
        app(&db),
        post_json(
            "/api/forum/threads",
            Some(&token),
            json!({"category_id": 1, "title": "Hello Router", "content": "first"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["thread"]["slug"], "hello-router");

    let (status, listed) = send(app(&db), get("/api/forum/threads?category=general")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["pagination"]["total"], 1);
    assert_eq!(listed["pagination"]["totalPages"], 1);
    assert_eq!(listed["items"][0]["title"], "Hello Router");

    let (status, me) = send(
        app(&db),
        Request::builder()
            .uri("/api/auth/me")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["forum_post_count"], 1);
}

#[tokio::test]
async fn test_validation_and_unknown_catalog() {
    let db = TestDb::new();
    let root = admin(&db.conn(), "root");
    let token = auth::issue_token(root, SECRET, 3600).unwrap();

    let (status, body) = send(
        app(&db),
        post_json(
            "/api/quiz/quizzes",
            Some(&token),
            json!({"title": "Bad", "difficulty": "impossible"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = send(app(&db), get("/api/catalog/widgets")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, categories) = send(app(&db), get("/api/forum/categories")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(categories[0]["slug"], "general");
}
