//! Structured application errors.
//!
//! Every failure that crosses into UPM code is turned into an [`AppError`]
//! exactly once, at the boundary where it leaves the external dependency.
//! Later layers re-wrap it to add context; the inner codes stay reachable
//! through the cause chain, and [`AppError::matches`] searches all of them.
//!
//! ```text
//! INTERNAL_ERROR [failed after 3 attempts]: NETWORK_ERROR [dial db]: connection refused
//! └── outermost ──────────────────────────┘ └── cause ──────────────┘ └── foreign ────┘
//! ```

use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed foreign failure accepted by [`AppError::wrap`] and friends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure categories shared by every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthorized,
    ServiceUnavailable,
    ServiceNotFound,
    ServiceExists,
    NetworkError,
    Timeout,
    ConnectionLost,
    ConfigError,
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    InternalError,
}

/// Taxonomy group of an [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Caller mistakes: bad input, missing or conflicting resources, auth.
    Client,
    /// A dependency or service is not reachable under its expected name.
    Availability,
    /// The network path failed.
    Transport,
    /// Bugs and misconfiguration.
    Internal,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 14] = [
        ErrorCode::InvalidArgument,
        ErrorCode::NotFound,
        ErrorCode::AlreadyExists,
        ErrorCode::PermissionDenied,
        ErrorCode::Unauthorized,
        ErrorCode::ServiceUnavailable,
        ErrorCode::ServiceNotFound,
        ErrorCode::ServiceExists,
        ErrorCode::NetworkError,
        ErrorCode::Timeout,
        ErrorCode::ConnectionLost,
        ErrorCode::ConfigError,
        ErrorCode::Validation,
        ErrorCode::InternalError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::ServiceNotFound => "SERVICE_NOT_FOUND",
            ErrorCode::ServiceExists => "SERVICE_EXISTS",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::Validation => "VALIDATION_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// HTTP status class used when the error leaves the process.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidArgument | ErrorCode::Validation => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::AlreadyExists | ErrorCode::ServiceExists => 409,
            ErrorCode::InternalError
            | ErrorCode::ServiceUnavailable
            | ErrorCode::ServiceNotFound
            | ErrorCode::ConfigError => 500,
            ErrorCode::NetworkError | ErrorCode::Timeout | ErrorCode::ConnectionLost => 503,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.http_status())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::InvalidArgument
            | ErrorCode::Validation
            | ErrorCode::NotFound
            | ErrorCode::AlreadyExists
            | ErrorCode::PermissionDenied
            | ErrorCode::Unauthorized => ErrorCategory::Client,
            ErrorCode::ServiceUnavailable
            | ErrorCode::ServiceNotFound
            | ErrorCode::ServiceExists => ErrorCategory::Availability,
            ErrorCode::NetworkError | ErrorCode::Timeout | ErrorCode::ConnectionLost => {
                ErrorCategory::Transport
            }
            ErrorCode::InternalError | ErrorCode::ConfigError => ErrorCategory::Internal,
        }
    }

    /// Codes worth retrying when the caller has not said otherwise.
    pub fn is_retryable_by_default(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError
                | ErrorCode::Timeout
                | ErrorCode::ConnectionLost
                | ErrorCode::ServiceUnavailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .into_iter()
            .find(|code| code.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown error code: {}", s))
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Client => write!(f, "client"),
            ErrorCategory::Availability => write!(f, "availability"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

/// Substring rules for [`classify`], checked in order.
const CLASSIFICATION_RULES: [(&str, ErrorCode); 6] = [
    ("not found", ErrorCode::NotFound),
    ("already exists", ErrorCode::AlreadyExists),
    ("permission denied", ErrorCode::PermissionDenied),
    ("unauthorized", ErrorCode::Unauthorized),
    ("invalid", ErrorCode::InvalidArgument),
    ("timeout", ErrorCode::Timeout),
];

/// Guess a code from a foreign failure's message.
///
/// The first matching rule wins, so "invalid timeout" is an
/// `InvalidArgument`. Only meant for failures that carry no structure;
/// call sites that know what went wrong should build the [`AppError`]
/// themselves.
pub fn classify(message: &str) -> ErrorCode {
    CLASSIFICATION_RULES
        .iter()
        .find(|(needle, _)| message.contains(needle))
        .map(|(_, code)| *code)
        .unwrap_or(ErrorCode::InternalError)
}

/// A failure from outside UPM, reduced to its rendered message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ForeignError {
    message: String,
}

impl ForeignError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The next link of a cause chain.
#[derive(Debug, Clone)]
pub enum ErrorCause {
    App(Box<AppError>),
    Foreign(ForeignError),
}

impl ErrorCause {
    fn from_boxed(failure: BoxError) -> Self {
        match failure.downcast::<AppError>() {
            Ok(app) => ErrorCause::App(app),
            Err(foreign) => ErrorCause::Foreign(ForeignError::new(foreign.to_string())),
        }
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCause::App(err) => write!(f, "{err}"),
            ErrorCause::Foreign(err) => write!(f, "{err}"),
        }
    }
}

/// Structured application error.
///
/// Immutable once built, except for metadata which may be added (last
/// write wins per key).
#[derive(Debug, Clone)]
pub struct AppError {
    code: ErrorCode,
    message: String,
    cause: Option<ErrorCause>,
    metadata: HashMap<String, serde_json::Value>,
    timestamp: DateTime<Utc>,
    location: &'static Location<'static>,
    debug_context: Option<String>,
}

impl AppError {
    #[track_caller]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::build(code, message.into(), None)
    }

    /// Wrap `failure` under a new code and message.
    ///
    /// An [`AppError`] becomes the next link of the chain; anything else
    /// becomes a terminal [`ForeignError`] holding its rendered message.
    #[track_caller]
    pub fn wrap<E>(failure: E, code: ErrorCode, message: impl Into<String>) -> Self
    where
        E: Into<BoxError>,
    {
        let cause = ErrorCause::from_boxed(failure.into());
        Self::build(code, message.into(), Some(cause))
    }

    /// Bring an arbitrary failure under UPM control.
    ///
    /// An [`AppError`] passes through untouched. A foreign failure is
    /// wrapped with the code [`classify`] picks for its message.
    #[track_caller]
    pub fn from_failure<E>(failure: E) -> Self
    where
        E: Into<BoxError>,
    {
        match failure.into().downcast::<AppError>() {
            Ok(app) => *app,
            Err(foreign) => {
                let message = foreign.to_string();
                let code = classify(&message);
                let cause = ErrorCause::Foreign(ForeignError::new(message.clone()));
                Self::build(code, message, Some(cause))
            }
        }
    }

    #[track_caller]
    fn build(code: ErrorCode, message: String, cause: Option<ErrorCause>) -> Self {
        Self {
            code,
            message,
            cause,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            location: Location::caller(),
            debug_context: capture_debug_context(),
        }
    }

    /// `field` failed validation.
    #[track_caller]
    pub fn validation(field: &str, message: &str) -> Self {
        Self::new(
            ErrorCode::Validation,
            format!("validation failed for field '{field}': {message}"),
        )
    }

    #[track_caller]
    pub fn not_found(resource: &str, identifier: &str) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("{resource} '{identifier}' not found"),
        )
    }

    #[track_caller]
    pub fn already_exists(resource: &str, identifier: &str) -> Self {
        Self::new(
            ErrorCode::AlreadyExists,
            format!("{resource} '{identifier}' already exists"),
        )
    }

    #[track_caller]
    pub fn unauthorized(reason: &str) -> Self {
        Self::new(ErrorCode::Unauthorized, format!("unauthorized: {reason}"))
    }

    #[track_caller]
    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("operation '{operation}' timed out after {after:?}"),
        )
    }

    #[track_caller]
    pub fn network<E>(operation: &str, endpoint: &str, cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::wrap(
            cause,
            ErrorCode::NetworkError,
            format!("network error during {operation} to {endpoint}"),
        )
    }

    /// Fold several errors into one.
    ///
    /// Returns `None` for no errors and the error itself for exactly one.
    #[track_caller]
    pub fn combine(errors: impl IntoIterator<Item = AppError>) -> Option<Self> {
        let mut errors: Vec<AppError> = errors.into_iter().collect();
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => {
                let mut message = String::from("multiple errors occurred:");
                for (i, err) in errors.iter().enumerate() {
                    message.push_str(&format!("\n  {}. {}", i + 1, err));
                }
                Some(Self::new(ErrorCode::InternalError, message))
            }
        }
    }

    /// Replace the captured debug context.
    pub fn with_debug_context(mut self, context: impl Into<String>) -> Self {
        self.debug_context = Some(context.into());
        self
    }

    pub fn add_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.insert_metadata(key, value);
        self
    }

    pub fn with_metadata<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        for (key, value) in entries {
            self.insert_metadata(key, value);
        }
        self
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Code of this error itself, ignoring anything further down the chain.
    pub fn extract_code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Metadata as text; non-string values are rendered as JSON.
    pub fn string_metadata(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(|value| match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Where this error was constructed.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn debug_context(&self) -> Option<&str> {
        self.debug_context.as_deref()
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    pub fn is_client_error(&self) -> bool {
        self.code.is_client_error()
    }

    pub fn is_server_error(&self) -> bool {
        self.code.is_server_error()
    }

    /// Walk the [`AppError`] links, outermost first.
    pub fn chain(&self) -> Chain<'_> {
        Chain { next: Some(self) }
    }

    /// Whether any link of the chain carries one of `codes`.
    pub fn matches(&self, codes: &[ErrorCode]) -> bool {
        self.chain().any(|link| codes.contains(&link.code))
    }

    /// Innermost failure of the chain.
    pub fn root_cause(&self) -> &(dyn std::error::Error + 'static) {
        let innermost = self.chain().last().unwrap_or(self);
        match &innermost.cause {
            Some(ErrorCause::Foreign(foreign)) => foreign,
            _ => innermost,
        }
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    /// The only view of this error that may leave the process.
    pub fn public_view(&self) -> PublicError {
        PublicError {
            code: self.code,
            message: self.message.clone(),
            metadata: (!self.metadata.is_empty()).then(|| self.metadata.clone()),
        }
    }

    /// Emit through `tracing`: client errors at WARN, the rest at ERROR.
    pub fn log(&self) {
        let metadata: serde_json::Map<String, serde_json::Value> = self
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let metadata = serde_json::Value::Object(metadata);

        if self.is_client_error() {
            tracing::warn!(
                error_code = %self.code,
                timestamp = %self.timestamp,
                %metadata,
                error = %self,
                "client error"
            );
        } else {
            tracing::error!(
                error_code = %self.code,
                timestamp = %self.timestamp,
                %metadata,
                error = %self,
                "server error"
            );
        }

        if self.code == ErrorCode::InternalError {
            tracing::debug!(
                error_code = %self.code,
                location = %self.location,
                debug_context = self.debug_context.as_deref().unwrap_or("<not captured>"),
                "debug context"
            );
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{} [{}]: {}", self.code, self.message, cause),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.cause.as_ref()? {
            ErrorCause::App(inner) => Some(&**inner),
            ErrorCause::Foreign(foreign) => Some(foreign),
        }
    }
}

/// Iterator over the [`AppError`] links of a cause chain.
pub struct Chain<'a> {
    next: Option<&'a AppError>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a AppError;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = match &current.cause {
            Some(ErrorCause::App(inner)) => Some(&**inner),
            _ => None,
        };
        Some(current)
    }
}

/// Error fields safe to return to a remote caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Backtrace of the constructing call, when backtraces are enabled.
fn capture_debug_context() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}
