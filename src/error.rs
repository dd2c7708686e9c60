// error.rs - Centralized error handling using thiserror

use serde::{Deserialize, Serialize};

/// Crate-wide Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sync core
///
/// Uses thiserror for ergonomic error handling and automatic Display impl.
/// All errors are serializable so the embedding shell can forward them to a
/// frontend without re-wrapping.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Sync error: {0}")]
    Sync(String),

    /// Writes are refused while the migration guardrail is set.
    #[error("Sync writes blocked: {0}")]
    WriteBlocked(String),
}

impl Error {
    /// Protocol error carrying a stable reason code prefix, e.g.
    /// `PULL_RESPONSE_INVALID: root must be an object`.
    pub fn protocol(code: &str, message: impl Into<String>) -> Self {
        Error::Protocol(format!("{}: {}", code, message.into()))
    }

    /// True when the error message starts with the given reason code.
    pub fn has_code(&self, code: &str) -> bool {
        match self {
            Error::Protocol(msg) | Error::Validation(msg) => msg.starts_with(code),
            _ => false,
        }
    }
}

// Implement conversions from common error types
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Error::Network(err.to_string())
        } else {
            Error::Sync(err.to_string())
        }
    }
}
