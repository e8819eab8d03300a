//! Error types for caseflow.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The job was recovered or re-claimed after this attempt's lease ran
    /// out. Whatever the attempt produced is discarded.
    #[error("lease on job {job} lost (attempt {attempt})")]
    LeaseLost { job: String, attempt: u32 },

    /// Structurally invalid input. Fatal to the current job attempt.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// The scoring oracle exited non-zero, reported an error, or emitted
    /// output we could not parse. `raw_output` keeps what it printed.
    #[error("scoring oracle failed: {message}")]
    Oracle {
        message: String,
        raw_output: Option<String>,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Transient infrastructure failures are retried up to the job's
    /// attempt ceiling. Everything else fails the attempt for good.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::Database(_) | Error::Io(_)
        )
    }

    /// Failure detail recorded on the job. Oracle failures carry the raw
    /// process output so an operator can see what came back.
    pub fn detail(&self) -> String {
        match self {
            Error::Oracle {
                raw_output: Some(raw),
                ..
            } => format!("{self}; raw output: {raw}"),
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
