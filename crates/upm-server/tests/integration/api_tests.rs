use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use upm_core::circuit_breaker::CircuitState;
use upm_server::dto::ErrorResponse;

use crate::common::setup_test_app;

async fn get(router: axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app();

    let (status, body) = get(app.router, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn error_status_follows_code() {
    let cases = [
        ("INVALID_ARGUMENT", StatusCode::BAD_REQUEST),
        ("VALIDATION_ERROR", StatusCode::BAD_REQUEST),
        ("UNAUTHORIZED", StatusCode::UNAUTHORIZED),
        ("PERMISSION_DENIED", StatusCode::FORBIDDEN),
        ("NOT_FOUND", StatusCode::NOT_FOUND),
        ("ALREADY_EXISTS", StatusCode::CONFLICT),
        ("SERVICE_UNAVAILABLE", StatusCode::INTERNAL_SERVER_ERROR),
        ("TIMEOUT", StatusCode::SERVICE_UNAVAILABLE),
    ];

    for (code, expected) in cases {
        let app = setup_test_app();
        let (status, body) = get(app.router, &format!("/errors/{code}")).await;

        assert_eq!(status, expected, "status for {code}");
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], code);
        assert_eq!(json["error"]["message"], "raised on request");
        assert!(json["error"].get("metadata").is_none());
    }
}

#[tokio::test]
async fn unknown_code_is_a_bad_request() {
    let app = setup_test_app();

    let (status, body) = get(app.router, "/errors/NOT_A_CODE").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "INVALID_ARGUMENT");
}

#[tokio::test]
async fn metadata_is_rendered() {
    let app = setup_test_app();

    let (status, body) = get(app.router, "/items/42").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let response: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.error.message, "item '42' not found");
    let metadata = response.error.metadata.unwrap();
    assert_eq!(metadata["resource"], "item");
    assert_eq!(metadata["id"], "42");
}

#[tokio::test]
async fn panic_becomes_internal_error() {
    let app = setup_test_app();

    let (status, body) = get(app.router, "/panic").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "INTERNAL_ERROR");
    assert_eq!(json["error"]["message"], "internal server error");
    assert!(!String::from_utf8_lossy(&body).contains("exploded"));
}

// ---------------------------------------------------------------------------
// Circuit breaker behind a handler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn open_circuit_rejects_with_retry_hint() {
    let app = setup_test_app();

    // Foreign failures are classified before they reach the response.
    for _ in 0..2 {
        let (status, body) = get(app.router.clone(), "/inventory").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(json["error"]["message"], "connection refused by inventory db");
    }
    assert_eq!(app.breaker.state(), CircuitState::Open);

    let (status, body) = get(app.router, "/inventory").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "SERVICE_UNAVAILABLE");
    assert_eq!(
        json["error"]["message"],
        "circuit breaker 'inventory' is open"
    );
    assert_eq!(json["error"]["metadata"]["circuit"], "inventory");
    assert!(json["error"]["metadata"]["retry_after_ms"].as_u64().unwrap() > 0);
}
