//! Error taxonomy shared across every component.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardianError {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("provider throttled")]
    Throttled,

    #[error("call timed out")]
    Timeout,

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream rule installation failed: {0}")]
    UpstreamFailure(String),

    #[error("store initialization conflict: {0}")]
    Conflict(String),

    #[error("store io error: {0}")]
    IOError(String),
}

impl From<rusqlite::Error> for GuardianError {
    fn from(e: rusqlite::Error) -> Self {
        GuardianError::IOError(e.to_string())
    }
}

impl From<r2d2::Error> for GuardianError {
    fn from(e: r2d2::Error) -> Self {
        GuardianError::IOError(e.to_string())
    }
}

impl From<reqwest::Error> for GuardianError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GuardianError::Timeout
        } else {
            GuardianError::Unreachable(e.to_string())
        }
    }
}

pub type GuardianResult<T> = Result<T, GuardianError>;
