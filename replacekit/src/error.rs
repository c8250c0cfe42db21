use std::time::Duration;
use thiserror::Error;

/// What a `NotFound` error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Task,
    Session,
}

impl std::fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotFoundKind::Task => write!(f, "task"),
            NotFoundKind::Session => write!(f, "session"),
        }
    }
}

/// Errors surfaced by the batch replace service
#[derive(Error, Debug)]
pub enum ReplaceError {
    #[error("Syntax error in rule {rule}: {message}")]
    Syntax { rule: usize, message: String },

    #[error("Unsafe regex in rule {rule}: {message}")]
    UnsafeRegex { rule: usize, message: String },

    #[error("I/O error on {file}: {message}")]
    Io { file: String, message: String },

    #[error("Rule {rule} timed out after {elapsed_ms}ms")]
    Timeout { rule: usize, elapsed_ms: u64 },

    #[error("{kind} not found: {id}")]
    NotFound { kind: NotFoundKind, id: String },

    #[error("Task {0} has not reached a terminal state yet")]
    NotReady(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("No valid rules in document ({invalid} rejected)")]
    NoValidRules { invalid: usize },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl ReplaceError {
    pub fn task_not_found(id: impl Into<String>) -> Self {
        ReplaceError::NotFound {
            kind: NotFoundKind::Task,
            id: id.into(),
        }
    }

    pub fn session_not_found(id: impl Into<String>) -> Self {
        ReplaceError::NotFound {
            kind: NotFoundKind::Session,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReplaceError::NotFound { .. })
    }
}

/// Errors reported by the session file collaborator
#[derive(Error, Debug)]
pub enum FileServiceError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Failed to decode {path} as UTF-8")]
    Encoding { path: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FileServiceError {
    /// Errors that mean the whole session workspace is gone, not just one file
    pub fn is_workspace_level(&self) -> bool {
        matches!(
            self,
            FileServiceError::SessionNotFound(_) | FileServiceError::StorageUnavailable(_)
        )
    }
}

impl From<&FileServiceError> for ReplaceError {
    fn from(err: &FileServiceError) -> Self {
        match err {
            FileServiceError::SessionNotFound(id) => ReplaceError::session_not_found(id.clone()),
            FileServiceError::StorageUnavailable(what) => ReplaceError::Io {
                file: what.clone(),
                message: err.to_string(),
            },
            FileServiceError::InvalidPath(path)
            | FileServiceError::Encoding { path }
            | FileServiceError::Io { path, .. } => ReplaceError::Io {
                file: path.clone(),
                message: err.to_string(),
            },
        }
    }
}

/// Failure modes of the bounded-time guard
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("guard worker could not be spawned: {0}")]
    Spawn(String),

    #[error("guard worker exited without a result")]
    WorkerLost,
}

pub type Result<T> = std::result::Result<T, ReplaceError>;
