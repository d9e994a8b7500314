//! HTTP adapter: error responses and panic recovery for axum services.

pub mod dto;
pub mod error;
pub mod recovery;

pub use error::ApiError;
