//! Black-box tests of the HTTP surface, backed by in-memory storage.

use api_lib::{
    config::Config,
    web::{self, state::AppState},
};
use axum::{
    body::Body,
    http::{HeaderValue, Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use circulation_core::{
    Book, BookId, BookStatus, CirculationEngine, InMemoryStorage, ManualClock, Role, UserId,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use tracing::Level;

async fn app() -> Router {
    let storage = Arc::new(InMemoryStorage::new());
    storage.add_user(UserId::new(1).unwrap(), Role::User).await;
    storage.add_user(UserId::new(2).unwrap(), Role::User).await;
    storage.add_user(UserId::new(9).unwrap(), Role::Admin).await;
    for (id, total) in [(1, 2), (2, 0)] {
        storage
            .add_book(
                Book {
                    id: BookId::new(id).unwrap(),
                    title: format!("Book {}", id),
                    author: "Oğuz Atay".to_string(),
                    isbn: format!("978975470011{}", id),
                    category_id: None,
                    publisher: "İletişim".to_string(),
                    status: BookStatus::Active,
                },
                total,
            )
            .await
            .unwrap();
    }

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 10, 1, 8, 0, 0).unwrap(),
    ));
    let config = Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        database_url: "postgres://unused".to_string(),
        log_level: Level::INFO,
        db_max_connections: 1,
        cors_origin: HeaderValue::from_static("http://localhost:3000"),
    };
    web::router(Arc::new(AppState {
        engine: CirculationEngine::with_backend(storage, clock),
        config: Arc::new(config),
    }))
}

fn post(uri: &str, user: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-user-id", user)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str, user: &str, role: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-user-id", user)
        .header("x-user-role", role)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn borrow_and_return_round_trip() {
    let app = app().await;

    let (status, body) = send(&app, post("/circulation/borrow", "1", json!({ "bookId": 1 }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["bookId"], 1);
    assert_eq!(body["dueDate"], "2024-10-16T08:00:00Z");

    let (status, body) = send(&app, get("/books/1/inventory", "1", "user")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], 1);

    let (status, body) = send(&app, get("/users/1/borrows", "1", "user")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["title"], "Book 1");
    assert_eq!(body[0]["overdue"], false);

    let (status, _) = send(&app, post("/circulation/return", "1", json!({ "bookId": 1 }))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, post("/circulation/return", "1", json!({ "bookId": 1 }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "NO_ACTIVE_RECORD");

    let (_, body) = send(&app, get("/books/1/inventory", "1", "user")).await;
    assert_eq!(body["available"], 2);
}

#[tokio::test]
async fn business_rejections_carry_their_code() {
    let app = app().await;

    let (status, body) = send(&app, post("/circulation/borrow", "1", json!({ "bookId": 2 }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "OUT_OF_STOCK");

    send(&app, post("/circulation/borrow", "1", json!({ "bookId": 1 }))).await;
    let (status, body) = send(&app, post("/circulation/borrow", "1", json!({ "bookId": 1 }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "ALREADY_HELD");

    let (status, body) = send(&app, post("/circulation/borrow", "1", json!({ "bookId": 0 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_REQUEST");

    let unknown = post("/circulation/borrow", "1", json!({ "bookId": 77 }));
    let (status, body) = send(&app, unknown).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
}

#[tokio::test]
async fn malformed_input_is_an_invalid_request() {
    let app = app().await;

    for payload in [json!({ "bookId": "abc" }), json!({}), json!({ "bookId": 1.5 })] {
        let (status, body) = send(&app, post("/circulation/borrow", "1", payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_REQUEST");
    }

    let (status, body) = send(&app, post("/circulation/return", "1", json!({ "book": 1 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_REQUEST");

    for (uri, user, role) in [
        ("/users/abc/borrows", "1", "user"),
        ("/books/first/inventory", "1", "user"),
        ("/transactions?limit=-1", "9", "admin"),
        ("/transactions?offset=many", "9", "admin"),
    ] {
        let (status, body) = send(&app, get(uri, user, role)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(body["error"], "INVALID_REQUEST", "{}", uri);
        assert!(body["message"].is_string());
    }

    // Nothing was lent out along the way.
    let (_, body) = send(&app, get("/books/1/inventory", "1", "user")).await;
    assert_eq!(body["available"], 2);
}

#[tokio::test]
async fn identity_is_required() {
    let app = app().await;
    let req = Request::builder()
        .method("POST")
        .uri("/circulation/borrow")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "bookId": 1 }).to_string()))
        .unwrap();

    let (status, body) = send(&app, req).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "UNAUTHENTICATED");
}

#[tokio::test]
async fn members_cannot_read_other_members_or_the_log() {
    let app = app().await;

    let (status, _) = send(&app, get("/users/1/borrows", "2", "user")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, get("/transactions", "2", "user")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, get("/users/1/borrows", "9", "admin")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn admins_page_through_the_log_newest_first() {
    let app = app().await;
    send(&app, post("/circulation/borrow", "1", json!({ "bookId": 1 }))).await;
    send(&app, post("/circulation/borrow", "2", json!({ "bookId": 1 }))).await;
    send(&app, post("/circulation/return", "1", json!({ "bookId": 1 }))).await;

    let (status, body) = send(&app, get("/transactions?limit=2", "9", "admin")).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["type"], "RETURN");
    assert_eq!(entries[0]["userId"], 1);
    assert_eq!(entries[1]["type"], "BORROW");
    assert_eq!(entries[1]["userId"], 2);

    let (_, body) = send(&app, get("/transactions?offset=2", "9", "admin")).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}
