use crate::operation::{DocKey, Operation};
use crate::path::{PathDisplay, PathSegment};
use thiserror::Error;

/// Failures raised by the OT engine while applying, transforming,
/// composing or inverting operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OtError {
    #[error("operation does not fit the document at {path}: {reason}")]
    IncompatibleOperation { path: String, reason: String },

    #[error("operation cannot be inverted: {0}")]
    NotInvertible(String),

    #[error("operations cannot be composed: {0}")]
    CannotCompose(String),

    #[error("document already exists")]
    DocumentExists,

    #[error("document does not exist")]
    DocumentMissing,
}

impl OtError {
    pub fn incompatible(path: &[PathSegment], reason: impl Into<String>) -> Self {
        OtError::IncompatibleOperation {
            path: PathDisplay(path).to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures of [`crate::OperationLog::append`] and [`crate::OperationLog::submit`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AppendError {
    /// The submitter's base version is not the current one. `missing`
    /// holds the committed operations the submitter has not seen.
    #[error("version conflict: document is at version {current_version}")]
    VersionConflict {
        current_version: u64,
        missing: Vec<Operation>,
    },

    #[error(transparent)]
    Rejected(#[from] OtError),
}

/// Failures talking to a document actor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArenaError {
    #[error(transparent)]
    Append(#[from] AppendError),

    #[error("document actor for {0} is gone")]
    Unavailable(DocKey),
}
