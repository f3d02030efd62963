//! Error taxonomy.
//!
//! Queue errors are surfaced to the worker loop, provider errors never leave
//! the pipeline, and only `ConfigError` / `BuildError` are fatal (startup).

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::TaskId;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed task on enqueue; never persisted.
    #[error("invalid task: {0}")]
    Validation(String),

    /// Lost a race for a task. Callers treat this as a miss.
    #[error("task {0} was claimed by another worker")]
    ClaimConflict(TaskId),

    /// `complete` / `fail` on a task that is not currently processing.
    #[error("task {0} is not processing")]
    NotFound(TaskId),

    #[error("queue backend unreachable: {0}")]
    Connection(String),

    #[error("queue i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt task record at {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("queue backend error: {0}")]
    Backend(String),
}

impl QueueError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Lost-race errors are misses, not failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, QueueError::ClaimConflict(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            QueueError::Connection(err.to_string())
        } else {
            QueueError::Backend(err.to_string())
        }
    }
}

/// Failure of a single generation strategy. All variants are recovered by
/// advancing to the next strategy.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} timed out")]
    Timeout { provider: String },

    #[error("{provider} rejected credentials: {message}")]
    Authentication { provider: String, message: String },

    #[error("{provider} returned a malformed response: {message}")]
    MalformedResponse { provider: String, message: String },

    #[error("{provider} answered HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} transport error: {message}")]
    Transport { provider: String, message: String },

    #[error("{provider} is not configured: {message}")]
    NotConfigured { provider: String, message: String },
}

impl ProviderError {
    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::Authentication { .. } => "authentication",
            ProviderError::MalformedResponse { .. } => "malformed_response",
            ProviderError::Http { .. } => "http",
            ProviderError::Transport { .. } => "transport",
            ProviderError::NotConfigured { .. } => "not_configured",
        }
    }

    pub(crate) fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout {
                provider: provider.to_string(),
            }
        } else if err.is_decode() {
            ProviderError::MalformedResponse {
                provider: provider.to_string(),
                message: err.to_string(),
            }
        } else {
            ProviderError::Transport {
                provider: provider.to_string(),
                message: err.to_string(),
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not derive generation requests: {0}")]
    Derivation(String),
}

/// Persisting pipeline output failed; the task is marked failed.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to encode {filename}: {message}")]
    Encode { filename: String, message: String },

    #[error("failed to store {}: {source}", path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("commit failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
