//! Error types for the store, the page engine and alignment jobs.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::jobs::Cursors;
use crate::storage::SyncDirection;
use crate::types::StreamKind;

/// Failures of a [`PageStore`](crate::storage::PageStore) primitive.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("collection '{0}' is not open")]
    NotOpen(String),

    #[error("no output page {index} in {stream} of '{collection}'")]
    MissingPage {
        collection: String,
        stream: StreamKind,
        index: usize,
    },

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("sync {direction} failed: {reason}")]
    Sync {
        direction: SyncDirection,
        reason: String,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures raised by a [`PageEngine`](crate::engine::PageEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("{0}")]
    Processing(String),

    #[error("page engine is unusable after an earlier panic")]
    Poisoned,
}

/// Why an alignment or direct-import job stopped early.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("cannot read dimensions of {stream} image {index} ({name}): {source}")]
    Decode {
        stream: StreamKind,
        index: usize,
        name: String,
        #[source]
        source: image::ImageError,
    },

    #[error("page engine failed on {stream} image {index}: {source}")]
    Engine {
        stream: StreamKind,
        index: usize,
        #[source]
        source: EngineError,
    },

    #[error("store sync failed after {stream} image {index}: {source}")]
    Sync {
        stream: StreamKind,
        index: usize,
        #[source]
        source: StoreError,
    },

    #[error("page engine reset failed: {0}")]
    Reset(#[source] EngineError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("scheduler reached an inconsistent state at {0:?}")]
    Inconsistent(Cursors),
}

impl JobError {
    /// Stream and input index of the step that failed, if the failure happened inside a step.
    pub fn failure_point(&self) -> Option<(StreamKind, usize)> {
        match self {
            JobError::Decode { stream, index, .. }
            | JobError::Engine { stream, index, .. }
            | JobError::Sync { stream, index, .. } => Some((*stream, *index)),
            JobError::Reset(_) | JobError::Store(_) | JobError::Inconsistent(_) => None,
        }
    }
}

/// A failed job together with the last-good cursor state.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct JobFailure {
    #[source]
    pub error: JobError,
    pub cursors: Cursors,
}

/// Errors returned to callers of the [`ImportJobClient`](crate::jobs::ImportJobClient).
///
/// Serializes as `{"code": "...", ...}` for UI matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ClientError {
    #[error("an alignment is already in progress for '{collection}'")]
    AlreadyInProgress { collection: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("alignment worker has stopped")]
    WorkerStopped,

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ClientError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<StoreError> for ClientError {
    fn from(err: StoreError) -> Self {
        Self::storage(err.to_string())
    }
}
