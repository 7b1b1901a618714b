use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure category reported by a generative model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    Timeout,
    RateLimited,
    MalformedOutput,
    Unavailable,
}

impl ModelErrorKind {
    /// Transient failures are retried with backoff. `MalformedOutput` gets a
    /// single corrective re-prompt instead.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ModelErrorKind::Timeout | ModelErrorKind::RateLimited | ModelErrorKind::Unavailable
        )
    }
}

impl fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelErrorKind::Timeout => "timeout",
            ModelErrorKind::RateLimited => "rate_limited",
            ModelErrorKind::MalformedOutput => "malformed_output",
            ModelErrorKind::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("model {kind}: {message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

impl ModelError {
    pub fn new(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ModelErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ModelErrorKind::RateLimited, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ModelErrorKind::MalformedOutput, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ModelErrorKind::Unavailable, message)
    }
}

#[derive(Debug, Error)]
pub enum SjtError {
    #[error(transparent)]
    Model(#[from] ModelError),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Data source errors
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SjtError>;
