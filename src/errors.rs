use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failure kinds produced by the archival engine.
///
/// `AlreadyStaging` and `TooManyJobs` carry retry-policy meaning and are
/// consumed by the job runner through [`ArchiveError::retry_signal`].
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: u32,
        stdout: String,
        stderr: String,
    },
    #[error("remote path `{0}` not found")]
    RemoteNotFound(String),
    #[error("`{0}` is already being staged from tape")]
    AlreadyStaging(String),
    #[error("too many concurrent `{kind}` jobs ({active} active, max {max})")]
    TooManyJobs {
        kind: String,
        active: usize,
        max: usize,
    },
    #[error("`{path}` still {status} after staging request")]
    StagingFailed { path: String, status: String },
    #[error("packing failed: {0}")]
    Packing(String),
    #[error("bundle `{0}` not found")]
    BundleNotFound(String),
    #[error("archive `{0}` not found")]
    ArchiveNotFound(String),
    #[error("archive {address}:{root_folder} for `{username}` already exists")]
    ArchiveExists {
        address: String,
        root_folder: String,
        username: String,
    },
    #[error("bundle `{0}` is already being uploaded")]
    UploadInProgress(String),
    #[error("refusing to delete bundle `{bundle}`: remote removal failed: {reason}")]
    RemoteDeleteRejected { bundle: String, reason: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Error kinds that ask the job runner to back off and retry without bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySignal {
    AlreadyStaging,
    TooManyJobs,
}

impl ArchiveError {
    pub fn retry_signal(&self) -> Option<RetrySignal> {
        match self {
            ArchiveError::AlreadyStaging(_) => Some(RetrySignal::AlreadyStaging),
            ArchiveError::TooManyJobs { .. } => Some(RetrySignal::TooManyJobs),
            _ => None,
        }
    }

    pub(crate) fn transport(context: &str, err: impl fmt::Display) -> Self {
        ArchiveError::Transport(format!("{context}: {err}"))
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ArchiveError> for AppError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::BundleNotFound(_) | ArchiveError::ArchiveNotFound(_) => {
                AppError::new(StatusCode::NOT_FOUND, err.to_string())
            }
            other => AppError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_staging_and_admission_are_retry_signals() {
        assert_eq!(
            ArchiveError::AlreadyStaging("x".into()).retry_signal(),
            Some(RetrySignal::AlreadyStaging)
        );
        let busy = ArchiveError::TooManyJobs {
            kind: "retrieve".into(),
            active: 4,
            max: 4,
        };
        assert_eq!(busy.retry_signal(), Some(RetrySignal::TooManyJobs));
        assert_eq!(ArchiveError::Transport("down".into()).retry_signal(), None);
        assert_eq!(
            ArchiveError::StagingFailed {
                path: "x".into(),
                status: "offline".into()
            }
            .retry_signal(),
            None
        );
    }
}
