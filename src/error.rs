//! Errors returned by the orchestrator and their JSON form

use crate::runtime::RuntimeError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No application with the given id
    AppNotFound,
    /// Request arguments out of range
    InvalidRequest,
    /// Container runtime could not be reached
    RuntimeUnavailable,
    /// Container runtime rejected an operation that the request depends on
    RuntimeError,
    /// Durable store failed
    StoreError,
    /// Proxy configuration could not be written
    ProxyError,
    /// Workflow exceeded the request timeout
    RequestTimeout,
    /// Response could not be produced
    InternalError,
}

impl ErrorCode {
    /// HTTP status code for a surface fronting the orchestrator
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorCode::AppNotFound => 404,
            ErrorCode::InvalidRequest => 400,
            ErrorCode::RuntimeUnavailable => 503,
            ErrorCode::RuntimeError => 502,
            ErrorCode::StoreError => 500,
            ErrorCode::ProxyError => 500,
            ErrorCode::RequestTimeout => 504,
            ErrorCode::InternalError => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AppNotFound => "APP_NOT_FOUND",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::RuntimeUnavailable => "RUNTIME_UNAVAILABLE",
            ErrorCode::RuntimeError => "RUNTIME_ERROR",
            ErrorCode::StoreError => "STORE_ERROR",
            ErrorCode::ProxyError => "PROXY_ERROR",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// A request-fatal failure
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("app {0} not found")]
    AppNotFound(i64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("container runtime error: {0}")]
    Runtime(RuntimeError),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("proxy configuration error: {0:#}")]
    Proxy(#[source] anyhow::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RuntimeError> for OrchestratorError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Unavailable(msg) => OrchestratorError::RuntimeUnavailable(msg),
            other => OrchestratorError::Runtime(other),
        }
    }
}

impl OrchestratorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::AppNotFound(_) => ErrorCode::AppNotFound,
            OrchestratorError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            OrchestratorError::RuntimeUnavailable(_) => ErrorCode::RuntimeUnavailable,
            OrchestratorError::Runtime(_) => ErrorCode::RuntimeError,
            OrchestratorError::Store(_) => ErrorCode::StoreError,
            OrchestratorError::Proxy(_) => ErrorCode::ProxyError,
            OrchestratorError::Timeout(_) => ErrorCode::RequestTimeout,
            OrchestratorError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.to_string())
    }
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code(),
            code,
            message: message.into(),
        }
    }

    /// `{"error": {...}}`
    pub fn to_json(&self) -> String {
        serde_json::to_string(&serde_json::json!({ "error": self })).unwrap_or_else(|_| {
            format!(
                r#"{{"error":{{"code":"{}","message":"{}","status":{}}}}}"#,
                self.code.as_str(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}
