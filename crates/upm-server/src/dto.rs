use serde::{Deserialize, Serialize};

use upm_core::error::{AppError, PublicError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Body of every error response: `{"error": {"code", "message", "metadata"?}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: PublicError,
}

impl From<&AppError> for ErrorResponse {
    fn from(err: &AppError) -> Self {
        Self {
            error: err.public_view(),
        }
    }
}
