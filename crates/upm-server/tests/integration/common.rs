use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::routing::get;

use upm_core::circuit_breaker::CircuitBreaker;
use upm_core::error::{AppError, ErrorCode};
use upm_core::reporter::NoopReporter;
use upm_server::error::ApiError;
use upm_server::recovery;

pub struct TestApp {
    pub router: Router,
    pub breaker: CircuitBreaker,
}

/// Router with one handler per error path the adapter has to cover.
pub fn setup_test_app() -> TestApp {
    let breaker = CircuitBreaker::with_settings("inventory", 2, Duration::from_secs(60), 1)
        .with_reporter(std::sync::Arc::new(NoopReporter));

    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/errors/{code}", get(raise))
        .route("/items/{id}", get(find_item))
        .route("/panic", get(explode))
        .route("/inventory", get(inventory))
        .with_state(breaker.clone())
        .layer(recovery::layer());

    TestApp { router, breaker }
}

async fn raise(Path(code): Path<String>) -> Result<&'static str, ApiError> {
    let code: ErrorCode = code
        .parse()
        .map_err(|msg: String| AppError::new(ErrorCode::InvalidArgument, msg))?;
    Err(AppError::new(code, "raised on request").into())
}

async fn find_item(Path(id): Path<String>) -> Result<&'static str, ApiError> {
    Err(AppError::not_found("item", &id)
        .add_metadata("resource", "item")
        .add_metadata("id", id.as_str())
        .into())
}

async fn explode() -> &'static str {
    panic!("handler exploded")
}

async fn inventory(State(breaker): State<CircuitBreaker>) -> Result<&'static str, ApiError> {
    let stock = breaker
        .execute(|| async { Err::<&'static str, _>("connection refused by inventory db") })
        .await?;
    Ok(stock)
}
