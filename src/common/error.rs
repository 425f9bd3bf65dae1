//! Error types for the scenario runner
//!
//! Every failure an action can produce maps onto one variant here, so the
//! runner can turn any rejected invocation into a failed test result with a
//! stable error code.

use std::io;
use thiserror::Error;

use crate::expr::ExpressionError;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the scenario runner
#[derive(Error, Debug)]
pub enum Error {
    // === Transport Errors ===
    #[error("Transport error talking to {target}: {message}")]
    Transport { target: String, message: String },

    // === Protocol Errors ===
    #[error("Unexpected status {status} from {target} (expected one of {expected:?})")]
    UnexpectedStatus {
        target: String,
        status: u16,
        expected: Vec<u16>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Validation Errors ===
    #[error("Validation '{expression}' failed: {reason}")]
    Validation { expression: String, reason: String },

    #[error("Expected {expected} messages on {source_name}, received {received}/{expected}")]
    CountMismatch {
        source_name: String,
        expected: usize,
        received: usize,
    },

    // === Expression Errors ===
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Proto error: {0}")]
    Proto(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transport error for a target
    pub fn transport(target: &str, message: impl ToString) -> Self {
        Self::Transport {
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a validation error for a predicate
    pub fn validation(expression: &str, reason: impl ToString) -> Self {
        Self::Validation {
            expression: expression.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a count mismatch error
    pub fn count_mismatch(source_name: &str, expected: usize, received: usize) -> Self {
        Self::CountMismatch {
            source_name: source_name.to_string(),
            expected,
            received,
        }
    }

    /// Create a file read error
    pub fn file_read(path: &std::path::Path, error: impl ToString) -> Self {
        Self::FileRead {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }

    /// Stable error code, used in summaries and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport { .. } => "TRANSPORT",
            Error::UnexpectedStatus { .. } | Error::Protocol(_) => "PROTOCOL",
            Error::Validation { .. } => "VALIDATION",
            Error::CountMismatch { .. } => "COUNT_MISMATCH",
            Error::Expression(_) => "EXPRESSION",
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG",
            Error::Io(_) | Error::FileRead { .. } => "IO",
            Error::Json(_) | Error::Yaml(_) | Error::Proto(_) => "CODEC",
            Error::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a retry of the same request could succeed
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}
