//! Integration tests for the HTTP endpoints
//!
//! Requests go through the full router, with the in-memory database
//! standing in for PostgreSQL.

mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use gaia_commons_api::server::{create_app, AppState};

use common::{pool_of_size, test_settings, FakeConnector};

fn app_for(db: &FakeConnector) -> Router {
    let state = AppState::with_pool(test_settings(), pool_of_size(db, 4));
    create_app(state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_reports_connected_database() {
    let db = FakeConnector::reachable();
    let (status, body) = get_json(app_for(&db), "/api/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"]["connected"], true);
    assert!(body["database"]["responseTime"]
        .as_str()
        .unwrap()
        .ends_with("ms"));
    assert_eq!(body["database"]["pool"]["totalConnections"], 1);
    assert_eq!(body["database"]["pool"]["idleConnections"], 1);
    assert_eq!(body["database"]["pool"]["waitingClients"], 0);
    assert!(body["memory"].is_object());
    assert_eq!(body["environment"], "development");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_health_unavailable_without_database() {
    let db = FakeConnector::unreachable();
    let (status, body) = get_json(app_for(&db), "/api/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["database"]["connected"], false);
    assert_eq!(body["database"]["pool"]["errors"], 1);
}

// =============================================================================
// Readiness and liveness
// =============================================================================

#[tokio::test]
async fn test_ready_with_database() {
    let db = FakeConnector::reachable();
    let (status, body) = get_json(app_for(&db), "/api/ready").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_not_ready_without_database() {
    let db = FakeConnector::unreachable();
    let (status, body) = get_json(app_for(&db), "/api/ready").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not ready");
    assert_eq!(body["reason"], "database unavailable");
    // A single attempt, no retry loop on the request path
    assert_eq!(db.connect_attempts(), 1);
}

#[tokio::test]
async fn test_live_never_touches_database() {
    let db = FakeConnector::unreachable();
    let (status, body) = get_json(app_for(&db), "/api/live").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
    assert!(body["uptime"].as_str().unwrap().ends_with('s'));
    assert_eq!(db.connect_attempts(), 0);
}

// =============================================================================
// Metrics
// =============================================================================

#[tokio::test]
async fn test_api_metrics_shape() {
    let db = FakeConnector::reachable();
    let (status, body) = get_json(app_for(&db), "/api/metrics").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"]["healthy"], true);
    assert!(body["database"]["latency"].is_number());
    assert_eq!(body["database"]["pool"]["totalConnections"], 1);
    assert!(body["uptime"].is_u64());
    assert!(body["memory"].is_object());
}

#[tokio::test]
async fn test_prometheus_metrics_exposes_pool_gauges() {
    let db = FakeConnector::reachable();
    let app = app_for(&db);

    let (status, body) = get(app, "/metrics").await;
    let text = String::from_utf8(body).unwrap();

    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("gaia_db_pool_connections"));
    assert!(text.contains("gaia_db_pool_waiting_clients"));
}

// =============================================================================
// Fallback
// =============================================================================

#[tokio::test]
async fn test_unknown_route_returns_not_found() {
    let db = FakeConnector::reachable();
    let (status, body) = get_json(app_for(&db), "/api/pilots").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "NOT_FOUND");
    assert_eq!(body["message"], "Route GET /api/pilots not found");
}
