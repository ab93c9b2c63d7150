//! Error types for fanlock.

use std::time::Duration;
use thiserror::Error;

/// Boxed cause carried out of a failed work unit.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    /// A work unit returned an error or panicked. Carries the first observed cause.
    #[error("batch execution failed")]
    ExecuteFailure(#[source] BoxError),

    #[error("batch execution timed out after {0:?}")]
    ExecuteTimeout(Duration),

    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("worker pool queue is full ({0} tasks waiting)")]
    PoolRejected(usize),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error")]
    Storage(#[from] sqlx::Error),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The work-unit cause, if this is an execution failure.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Error::ExecuteFailure(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Render an error and its whole `source()` chain on one line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
