use thiserror::Error;
use weft_core::{AppendError, ArenaError, OtError};

/// A client frame that could not be decoded. `field` names the offending
/// field (`op[1].p`, `collection`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed message at `{field}`: {message}")]
pub struct MalformedMessage {
    pub field: String,
    pub message: String,
}

impl MalformedMessage {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, "required field is missing")
    }
}

/// Message bus failures.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode bus payload: {0}")]
    Encode(String),

    #[error("bus backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Encode(e.to_string())
    }
}

#[cfg(feature = "redis-bus")]
impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            BusError::Unavailable(e.to_string())
        } else {
            BusError::Backend(e.to_string())
        }
    }
}

/// Errors surfaced to clients or to the session task.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The submitter must refetch and resubmit against `current_version`.
    #[error("version conflict: document is at version {current_version}")]
    VersionConflict {
        current_version: u64,
        missing: Vec<weft_core::Operation>,
    },

    #[error(transparent)]
    IncompatibleOperation(#[from] OtError),

    #[error(transparent)]
    MalformedMessage(#[from] MalformedMessage),

    /// Fatal to the session.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("relay unavailable: {0}")]
    RelayUnavailable(#[from] BusError),

    #[error("document {0} is unavailable")]
    DocumentUnavailable(String),
}

impl SyncError {
    /// Stable code carried in error frames.
    pub fn code(&self) -> u16 {
        match self {
            SyncError::VersionConflict { .. } => 409,
            SyncError::IncompatibleOperation(_) => 422,
            SyncError::MalformedMessage(_) => 400,
            SyncError::TransportFailure(_) => 499,
            SyncError::RelayUnavailable(_) | SyncError::DocumentUnavailable(_) => 503,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::VersionConflict { .. } => "version_conflict",
            SyncError::IncompatibleOperation(_) => "incompatible_operation",
            SyncError::MalformedMessage(_) => "malformed_message",
            SyncError::TransportFailure(_) => "transport_failure",
            SyncError::RelayUnavailable(_) => "relay_unavailable",
            SyncError::DocumentUnavailable(_) => "document_unavailable",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::TransportFailure(_))
    }
}

impl From<AppendError> for SyncError {
    fn from(e: AppendError) -> Self {
        match e {
            AppendError::VersionConflict {
                current_version,
                missing,
            } => SyncError::VersionConflict {
                current_version,
                missing,
            },
            AppendError::Rejected(e) => SyncError::IncompatibleOperation(e),
        }
    }
}

impl From<ArenaError> for SyncError {
    fn from(e: ArenaError) -> Self {
        match e {
            ArenaError::Append(e) => e.into(),
            ArenaError::Unavailable(key) => SyncError::DocumentUnavailable(key.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::TransportFailure(e.to_string())
    }
}
