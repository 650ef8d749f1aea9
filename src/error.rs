//! Error taxonomy for install runs.
//!
//! [`PipelineError`] covers failures that happen before any stage runs.
//! [`StageError`] is what a fetch, extract or install stage returns; its
//! [`ErrorKind`] is recorded next to the message in the run history.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification shared by every error a run can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    AlreadyRunning,
    Network,
    NotFound,
    UnsupportedFormat,
    CorruptArchive,
    PermissionDenied,
    DestinationConflict,
    Io,
    Cancelled,
}

impl ErrorKind {
    /// Whether re-running the same request may succeed without changing it.
    ///
    /// The pipeline never retries by itself; this is advice for the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Io)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::AlreadyRunning => "already running",
            ErrorKind::Network => "network error",
            ErrorKind::NotFound => "not found",
            ErrorKind::UnsupportedFormat => "unsupported format",
            ErrorKind::CorruptArchive => "corrupt archive",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::DestinationConflict => "destination conflict",
            ErrorKind::Io => "I/O error",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Errors raised by the orchestrator before a run is created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Invalid install request: {reason}")]
    InvalidRequest { reason: String },

    #[error("An install for '{request}' is already running")]
    AlreadyRunning { request: String },
}

impl PipelineError {
    pub fn invalid<S: Into<String>>(reason: S) -> Self {
        PipelineError::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            PipelineError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
        }
    }
}

/// Errors produced by a single pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Version '{version}' was not found upstream")]
    NotFound { version: String },

    #[error("Unsupported archive format: {}", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("Corrupt archive: {message}")]
    CorruptArchive { message: String },

    #[error("Permission denied: {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("Destination already exists: {}", path.display())]
    DestinationConflict { path: PathBuf },

    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    pub fn network<S: Into<String>>(message: S) -> Self {
        StageError::Network {
            message: message.into(),
        }
    }

    pub fn corrupt<S: Into<String>>(message: S) -> Self {
        StageError::CorruptArchive {
            message: message.into(),
        }
    }

    /// Map an I/O error touching `path`, keeping permission failures distinct.
    pub fn from_io_at(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            StageError::PermissionDenied { path: path.into() }
        } else {
            StageError::Io(err)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Network { .. } => ErrorKind::Network,
            StageError::NotFound { .. } => ErrorKind::NotFound,
            StageError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            StageError::CorruptArchive { .. } => ErrorKind::CorruptArchive,
            StageError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            StageError::DestinationConflict { .. } => ErrorKind::DestinationConflict,
            StageError::CommandFailed { .. } | StageError::Io(_) => ErrorKind::Io,
        }
    }
}
