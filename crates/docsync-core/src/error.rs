//! Error types for docsync core
//!
//! Provides error handling for:
//! - Network and server failures surfaced by write paths
//! - Recorded (non-thrown) load failures on read paths
//! - Content validation when edit layers are merged

use crate::types::{FileId, FileType};
use docsync_cache::FetchError;
use serde::{Deserialize, Serialize};

/// Main docsync error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Transport failure or non-2xx response with an unparsable body
    #[error("network error: {0}")]
    Network(String),

    /// Structured error body returned by the service
    #[error("server rejected request: {0}")]
    ServerValidation(String),

    /// File absent on the service
    #[error("file not found: {0}")]
    NotFound(FileId),

    /// Unique-constraint violation on create
    #[error("conflict: {0}")]
    Conflict(String),

    /// Access denied by the service
    #[error("permission denied: {0}")]
    Permission(String),

    /// File is not present (or has no content) in the local store
    #[error("file {0} is not loaded")]
    FileNotLoaded(FileId),

    /// Edit or merge would produce invalid content
    #[error(transparent)]
    InvalidContent(#[from] ContentError),

    /// Local validation failed before any network call
    #[error("validation failed: {0}")]
    Validation(String),

    /// The service saved only part of a batch
    #[error("publish saved {saved} of {requested} files; failed: {failed:?}")]
    PartialPublish {
        /// Files that were not confirmed as saved
        failed: Vec<FileId>,
        /// Number confirmed
        saved: usize,
        /// Number sent
        requested: usize,
    },

    /// Superseded by a newer request
    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Map a fetch failure onto the error taxonomy
    #[must_use]
    pub fn classify(err: &FetchError, file: Option<FileId>) -> Self {
        match err {
            FetchError::Cancelled => Self::Cancelled,
            FetchError::Network(m) | FetchError::Decode(m) => Self::Network(m.clone()),
            FetchError::Http { status, message } | FetchError::Server { status, message } => {
                let lower = message.to_lowercase();
                if *status == 404 {
                    file.map_or_else(|| Self::ServerValidation(message.clone()), Self::NotFound)
                } else if *status == 409 || is_conflict_text(&lower) {
                    Self::Conflict(message.clone())
                } else if matches!(status, 401 | 403) || is_permission_text(&lower) {
                    Self::Permission(message.clone())
                } else if err.is_structured() {
                    Self::ServerValidation(message.clone())
                } else {
                    Self::Network(message.clone())
                }
            }
        }
    }

    /// Check if retrying the same call may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::PartialPublish { .. } | Self::Cancelled
        )
    }
}

impl From<FetchError> for SyncError {
    fn from(err: FetchError) -> Self {
        Self::classify(&err, None)
    }
}

fn is_conflict_text(lower: &str) -> bool {
    lower.contains("unique constraint")
        || lower.contains("already exists")
        || lower.contains("duplicate key")
}

fn is_permission_text(lower: &str) -> bool {
    lower.contains("permission") || lower.contains("access denied") || lower.contains("forbidden")
        || lower.contains("not authorized")
}

/// Content could not be built from merged layers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    /// Merged value does not satisfy the type's schema
    #[error("invalid {file_type} content: {message}")]
    Invalid {
        /// Document type being built
        file_type: FileType,
        /// Deserializer message
        message: String,
    },

    /// Content was not a JSON object
    #[error("{0} content must be a JSON object")]
    NotAnObject(FileType),
}

/// Classification carried by a recorded [`LoadError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadErrorCode {
    /// Absent from a successful response
    NotFound,
    /// Transport or unstructured failure
    Network,
    /// Access denied
    Permission,
    /// Structured server error
    Server,
}

/// Load failure recorded on a file instead of being thrown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadError {
    /// Classification
    pub code: LoadErrorCode,
    /// Human-readable message
    pub message: String,
}

impl LoadError {
    /// File missing from a successful batch
    #[must_use]
    pub fn not_found(id: FileId) -> Self {
        Self {
            code: LoadErrorCode::NotFound,
            message: format!("file {id} not found"),
        }
    }
}

impl From<&SyncError> for LoadError {
    fn from(err: &SyncError) -> Self {
        let code = match err {
            SyncError::NotFound(_) => LoadErrorCode::NotFound,
            SyncError::Permission(_) => LoadErrorCode::Permission,
            SyncError::ServerValidation(_) | SyncError::Conflict(_) => LoadErrorCode::Server,
            _ => LoadErrorCode::Network,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}
