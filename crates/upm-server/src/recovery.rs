//! Turns handler panics into ordinary `INTERNAL_ERROR` responses.

use std::any::Any;

use axum::response::{IntoResponse, Response};
use tower_http::catch_panic::CatchPanicLayer;

use upm_core::error::{AppError, ErrorCode};

use crate::error::ApiError;

pub type PanicHandler = fn(Box<dyn Any + Send + 'static>) -> Response;

/// Handler for [`CatchPanicLayer::custom`].
///
/// The panic payload is kept as the error's cause so it reaches the logs,
/// but the response body only carries a generic message.
pub fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    tracing::error!(panic = %detail, "Recovered from handler panic");

    let err = AppError::wrap(
        format!("panic: {detail}"),
        ErrorCode::InternalError,
        "internal server error",
    );
    ApiError(err).into_response()
}

pub fn layer() -> CatchPanicLayer<PanicHandler> {
    CatchPanicLayer::custom(panic_response as PanicHandler)
}
