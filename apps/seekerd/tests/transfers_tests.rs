//! Transfer and state API integration tests.

mod common;

use axum::http::StatusCode;
use common::TestApp;
use uuid::Uuid;

#[tokio::test]
async fn test_health_reports_version() {
    let app = TestApp::standalone().await;
    let response = app.server.get("/health").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["version"], serde_json::json!(env!("CARGO_PKG_VERSION")));
}

#[tokio::test]
async fn test_state_reports_scan_pending_before_first_fill() {
    let app = TestApp::standalone().await;
    let response = app.server.get("/api/v0/state").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["shares"]["scan_pending"], serde_json::json!(true));
    assert_eq!(body["pending_restart"], serde_json::json!(false));
}

#[tokio::test]
async fn test_transfer_lists_start_empty() {
    let app = TestApp::standalone().await;

    for direction in ["downloads", "uploads"] {
        let response = app
            .server
            .get(&format!("/api/v0/transfers/{}", direction))
            .await;
        response.assert_status_ok();
        let records: Vec<serde_json::Value> = response.json();
        assert!(records.is_empty());
    }
}

#[tokio::test]
async fn test_unknown_transfer_is_not_found() {
    let app = TestApp::standalone().await;
    let response = app
        .server
        .get(&format!("/api/v0/transfers/uploads/{}", Uuid::new_v4()))
        .await;
    response.assert_status_not_found();
}

#[tokio::test]
async fn test_enqueue_without_protocol_backend_is_an_error() {
    let app = TestApp::standalone().await;
    let response = app
        .server
        .post("/api/v0/transfers/downloads")
        .json(&serde_json::json!({
            "username": "peer",
            "files": [{ "filename": "music\\a.mp3", "size": 100 }]
        }))
        .await;
    // The offline client cannot prime the peer connection.
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_enqueue_with_no_files_is_bad_request() {
    let app = TestApp::standalone().await;
    let response = app
        .server
        .post("/api/v0/transfers/downloads")
        .json(&serde_json::json!({ "username": "peer", "files": [] }))
        .await;
    response.assert_status_bad_request();
}

#[tokio::test]
async fn test_clear_completed_returns_no_content() {
    let app = TestApp::standalone().await;
    let response = app
        .server
        .delete("/api/v0/transfers/uploads/all/completed")
        .await;
    assert_eq!(response.status_code(), 204);
}

#[tokio::test]
async fn test_cancel_unknown_transfer_is_not_found() {
    let app = TestApp::standalone().await;
    let response = app
        .server
        .delete(&format!("/api/v0/transfers/downloads/{}", Uuid::new_v4()))
        .await;
    response.assert_status_not_found();
}
