use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("document validation error: {0}")]
    DocumentValidation(#[from] DocumentValidationError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    User(Box<dyn std::error::Error + Send + Sync>),

    #[error("transaction aborted: {0}")]
    Aborted(String),

    #[error("transaction failed: {message}")]
    TransactionFailed {
        message: String,
        #[source]
        source: Box<TxnError>,
    },

    #[error("{} of {total} parallel transaction(s) failed: {}", .failures.len(), summarize(.failures))]
    ParallelFailed {
        total: usize,
        failures: Vec<BranchFailure>,
    },

    #[error("schema version {requested} is older than the stored version {current}")]
    VersionMismatch { current: u32, requested: u32 },
}

impl TxnError {
    pub fn usage(message: impl Into<String>) -> Self {
        TxnError::Usage(message.into())
    }

    /// Wraps an application error raised inside a transaction closure.
    pub fn user<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        TxnError::User(err.into())
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        TxnError::Aborted(reason.into())
    }

    /// Errors that would occur no matter which pass raised them. These
    /// surface from the planning pass instead of being discarded.
    pub fn is_phase_independent(&self) -> bool {
        matches!(self, TxnError::Usage(_) | TxnError::DocumentValidation(_))
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, TxnError::Usage(_))
    }

    /// Shapes a failure for the `run` boundary. Usage errors and failures
    /// already reported by an inner run keep their shape.
    pub(crate) fn into_boundary(self) -> Self {
        match self {
            err @ (TxnError::Usage(_)
            | TxnError::TransactionFailed { .. }
            | TxnError::ParallelFailed { .. }
            | TxnError::VersionMismatch { .. }) => err,
            cause => TxnError::TransactionFailed {
                message: cause.to_string(),
                source: Box::new(cause),
            },
        }
    }

    /// The innermost cause of a `TransactionFailed`, or `self`.
    pub fn root_cause(&self) -> &TxnError {
        match self {
            TxnError::TransactionFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[derive(Debug)]
pub struct BranchFailure {
    pub index: usize,
    pub error: TxnError,
}

impl fmt::Display for BranchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch {}: {}", self.index, self.error)
    }
}

fn summarize(failures: &[BranchFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct DocumentValidationError(pub String);

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StorageError(pub String);
