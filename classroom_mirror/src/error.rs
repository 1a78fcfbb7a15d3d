//! Error types for the classroom_mirror crate.

use thiserror::Error;

/// Errors that can occur while mirroring Classroom and Drive content.
///
/// Only [`MirrorError::Auth`] is fatal to a run. Everything else is caught at
/// the task boundary and surfaced in the end-of-run summary.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transient remote error ({}): {message}", status.map_or_else(|| "network".to_string(), |s| s.to_string()))]
    Transient { status: Option<u16>, message: String },

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL or ID: {0}")]
    InvalidUrlOrId(String),

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("JWT encoding error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Incomplete body: expected {expected} bytes, received {actual}")]
    Incomplete { expected: u64, actual: u64 },
}

impl MirrorError {
    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MirrorError::Auth(_))
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MirrorError::Transient { .. } | MirrorError::Incomplete { .. } => true,
            MirrorError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
            }
            _ => false,
        }
    }

    /// Whether the remote service refused access to the resource.
    pub fn is_permission(&self) -> bool {
        matches!(self, MirrorError::Permission(_))
    }

    /// Map a non-success HTTP status and Google error reason to an error.
    pub fn from_status(status: u16, reason: Option<&str>, message: String) -> Self {
        match (status, reason) {
            (401, _) => MirrorError::Auth(message),
            (403, Some("rateLimitExceeded" | "userRateLimitExceeded")) => {
                MirrorError::Transient {
                    status: Some(status),
                    message,
                }
            }
            (403, _) => MirrorError::Permission(message),
            (404, _) => MirrorError::NotFound(message),
            (429, _) | (500..=599, _) => MirrorError::Transient {
                status: Some(status),
                message,
            },
            _ => MirrorError::Api { status, message },
        }
    }
}

/// Result type alias for MirrorError.
pub type Result<T> = std::result::Result<T, MirrorError>;
