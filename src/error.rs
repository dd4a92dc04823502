//! Error taxonomy and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors raised by the gateway core.
///
/// Configuration, state and filter errors are fatal to the phase that raised them.
/// Backend and solver errors are contained to the request that hit them.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// A declared mapping or capability is inconsistent
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A state store was initialized twice
    #[error("state '{0}' already initialized, merge into it instead")]
    StateInitialization(String),

    /// No free port could be allocated for a filter
    #[error("no free port available: {0}")]
    ResourceExhausted(#[source] std::io::Error),

    /// A filter process could not be started
    #[error("failed to launch filter '{entrypoint}': {reason}")]
    FilterLaunch { entrypoint: String, reason: String },

    /// A proxied request could not reach its backend. `reason` is logged, not shown.
    #[error("Could not connect with server on port {port}")]
    BackendUnavailable { port: u16, reason: String },

    /// The solver check failed to execute
    #[error("solver failed: {0}")]
    SolverExecution(String),

    /// Reading or writing the durable state blob failed
    #[error("state file {path}: {source}")]
    StateIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The durable state blob could not be decoded
    #[error("invalid state blob: {0}")]
    StateFormat(String),
}

pub type GateResult<T> = Result<T, GateError>;

impl GateError {
    /// Code used when this error ends a request
    pub fn error_code(&self) -> GateErrorCode {
        match self {
            GateError::BackendUnavailable { .. } => GateErrorCode::BackendUnavailable,
            _ => GateErrorCode::InternalError,
        }
    }
}

/// Error codes for HTTP error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateErrorCode {
    /// No route matches the request path
    NotFound,
    /// A route matches the path but not the method
    MethodNotAllowed,
    /// The challenge has not finished starting
    NotReady,
    /// The backend behind a mapping is unreachable
    BackendUnavailable,
    /// Internal gateway error
    InternalError,
}

impl GateErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateErrorCode::NotFound => StatusCode::NOT_FOUND,
            GateErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GateErrorCode::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            GateErrorCode::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GateErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GateErrorCode::NotFound => "NOT_FOUND",
            GateErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            GateErrorCode::NotReady => "NOT_READY",
            GateErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            GateErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GateErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GateErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gate-Error header
pub fn json_error_response(
    code: GateErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
