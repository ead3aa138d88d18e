//! Error taxonomy for the control plane and JSON error bodies for the admin API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the supervisor, the jobs and their collaborators
#[derive(Debug, Error)]
pub enum CoreError {
    /// `start` was called while a live engine process exists
    #[error("engine is already running")]
    AlreadyRunning,

    /// `stop` was called without a live engine process
    #[error("engine is not running")]
    NotRunning,

    /// The engine configuration could not be serialized or written
    #[error("failed to write engine configuration to {path}: {message}")]
    ConfigWrite { path: PathBuf, message: String },

    /// The engine binary could not be spawned
    #[error("failed to spawn engine binary {binary}: {source}")]
    ProcessSpawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A log file was missing or rotated mid-read
    #[error("failed to read log {path}: {source}")]
    LogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A malformed line or stat entry
    #[error("parse error: {0}")]
    Parse(String),

    /// Storage collaborator failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The external ban tool is not installed
    #[error("external tool not found: {0}")]
    ExternalToolMissing(String),

    /// The engine configuration provider failed
    #[error("engine configuration unavailable: {0}")]
    Config(String),

    /// Querying the engine's management interface failed
    #[error("stats query failed: {0}")]
    Stats(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Stable machine-readable code used in admin API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::AlreadyRunning => "ALREADY_RUNNING",
            CoreError::NotRunning => "NOT_RUNNING",
            CoreError::ConfigWrite { .. } => "CONFIG_WRITE",
            CoreError::ProcessSpawn { .. } => "PROCESS_SPAWN",
            CoreError::LogRead { .. } => "LOG_READ",
            CoreError::Parse(_) => "PARSE",
            CoreError::Persistence(_) => "PERSISTENCE",
            CoreError::ExternalToolMissing(_) => "EXTERNAL_TOOL_MISSING",
            CoreError::Config(_) => "CONFIG",
            CoreError::Stats(_) => "STATS",
        }
    }

    /// HTTP status the admin API answers with for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::AlreadyRunning | CoreError::NotRunning => StatusCode::CONFLICT,
            CoreError::Stats(_) | CoreError::ExternalToolMissing(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: status.as_u16(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code,
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Build a JSON error response for a [`CoreError`]
pub fn json_error_response(err: &CoreError) -> Response<Full<Bytes>> {
    let status = err.status_code();
    let body = ErrorResponse::new(err.code(), status, err.to_string()).to_json();

    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static header")
}
