#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt as _;
use imageio_server::api::tickets_router;
use imageio_server::buffer_pool::BufferPool;
use imageio_server::config::load_conf_file_or_generate_new;
use imageio_server::state::AppState;
use imageio_server::ticket_store::TicketStore;
use imageio_task::ShutdownHandle;
use serde_json::{Value, json};
use tower_service::Service as _;

fn test_state() -> AppState {
    let dir = tempfile::tempdir().unwrap();
    let conf_handle = load_conf_file_or_generate_new(
        camino::Utf8Path::from_path(&dir.path().join("imageio.json")).unwrap(),
    )
    .unwrap();
    let (_handle, shutdown_signal) = ShutdownHandle::new();
    AppState {
        conf_handle,
        tickets: TicketStore::new(),
        buffer_pool: Arc::new(BufferPool::new(64 * 1024)),
        shutdown_signal,
    }
}

fn router() -> Router<()> {
    tickets_router().with_state(test_state())
}

async fn send(app: &mut Router<()>, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.call(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body).unwrap() };
    (status, body)
}

#[tokio::test]
async fn put_then_get_then_delete_ticket() {
    let mut app = router();

    let spec = json!({
        "uuid": "tk1",
        "size": 1024,
        "url": "file:///var/lib/imageio/disk.img",
        "timeout": 300,
        "ops": ["read", "write"],
    });
    let request = Request::put("/tickets/tk1")
        .header("content-type", "application/json")
        .body(Body::from(spec.to_string()))
        .unwrap();
    let (status, _) = send(&mut app, request).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::get("/tickets/tk1").body(Body::empty()).unwrap();
    let (status, body) = send(&mut app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uuid"], "tk1");
    assert_eq!(body["size"], 1024);

    let request = Request::delete("/tickets/tk1").body(Body::empty()).unwrap();
    let (status, _) = send(&mut app, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let request = Request::get("/tickets/tk1").body(Body::empty()).unwrap();
    let (status, _) = send(&mut app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_unknown_ticket_is_not_found() {
    let mut app = router();
    let request = Request::get("/tickets/nope").body(Body::empty()).unwrap();
    let (status, _) = send(&mut app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn put_with_mismatched_uuid_is_rejected() {
    let mut app = router();
    let spec = json!({
        "uuid": "other",
        "size": 1,
        "url": "file:///tmp/disk.img",
        "timeout": 60,
        "ops": ["read"],
    });
    let request = Request::put("/tickets/tk1")
        .header("content-type", "application/json")
        .body(Body::from(spec.to_string()))
        .unwrap();
    let (status, _) = send(&mut app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn star_ticket_id_reports_synthetic_capabilities() {
    let mut app = router();
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/images/*")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&mut app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["features"].is_array());
}
