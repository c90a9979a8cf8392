use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Statuses reported by the transport core.
///
/// Cloneable: a single status frequently fans out to every call and
/// connection a reactor is tearing down, so the io payload sits behind
/// an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Submission refused; the target is not accepting work.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Work was accepted but cancelled before completion.
    #[error("aborted: {0}")]
    Aborted(String),
    /// A connection-level failure (reset, timeout on the wire).
    #[error("network error: {0}")]
    NetworkError(String),
    /// A deadline elapsed.
    #[error("timed out: {0}")]
    TimedOut(String),
    /// Operation attempted against a component in the wrong state
    /// (e.g. a worker pool that has been stopped).
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// Configuration rejected by `validate()`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl Error {
    /// Status for a submission refused because the reactor is closing.
    pub fn shutdown_refused() -> Self {
        Error::ServiceUnavailable("reactor is shutting down".into())
    }

    /// Status for work that was already accepted and is now cancelled
    /// by shutdown.
    pub fn shutdown_aborted() -> Self {
        Error::Aborted("reactor is shutting down".into())
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Error::ServiceUnavailable(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, Error::NetworkError(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::TimedOut(_))
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Error::IllegalState(_))
    }

    pub fn is_invalid_config(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
