use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::ReasonCode;

/// Typed error surfaced by a queue-consuming stage. Callers `match` on this
/// instead of sniffing error text, so a stage can decide retry vs. dead
/// letter vs. drop without string matching on provider error messages.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("transient error: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("rate limited until {retry_not_before}")]
    RateLimited { retry_not_before: DateTime<Utc> },

    #[error("duplicate, already processed")]
    Duplicate,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("policy skip: {0:?}")]
    PolicySkip(ReasonCode),

    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl StageError {
    /// Whether a queue worker should requeue this job with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Transient(_) | StageError::RateLimited { .. })
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        StageError::Transient(err)
    }
}

impl From<rusqlite::Error> for StageError {
    fn from(err: rusqlite::Error) -> Self {
        StageError::Transient(err.into())
    }
}
