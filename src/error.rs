//! # Error Model
//!
//! Every failure observable at the wire boundary maps to one of the kinds
//! below; internal details never leak past the server.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;

/// Failure kinds for reconciliation, storage, and the wire boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// Framing or decoding error on the wire.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    /// Referenced entity name is not registered.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    /// Referenced source name is not registered for the entity.
    #[error("unknown source: {0}")]
    UnknownSource(String),
    /// Target identifier does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Transient driver or store failure; the dispatcher retries these.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Foreign key already bound to a different internal key.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Patch cannot be applied to the given document.
    #[error("diff mismatch: {0}")]
    DiffMismatch(String),
    /// Shutdown observed mid-operation.
    #[error("cancelled")]
    Cancelled,
    /// Bug or invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::InvalidMessage(_) => ErrorKind::InvalidMessage,
            ReconcileError::UnknownEntity(_) => ErrorKind::UnknownEntity,
            ReconcileError::UnknownSource(_) => ErrorKind::UnknownSource,
            ReconcileError::NotFound(_) => ErrorKind::NotFound,
            ReconcileError::Unavailable(_) => ErrorKind::Unavailable,
            ReconcileError::Conflict(_) => ErrorKind::Conflict,
            ReconcileError::DiffMismatch(_) => ErrorKind::DiffMismatch,
            ReconcileError::Cancelled => ErrorKind::Cancelled,
            ReconcileError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the dispatcher should retry the failed cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Unavailable(_))
    }
}

/// Wire tag for an error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    InvalidMessage = 0,
    UnknownEntity = 1,
    UnknownSource = 2,
    NotFound = 3,
    Unavailable = 4,
    Conflict = 5,
    DiffMismatch = 6,
    Cancelled = 7,
    Internal = 8,
}

impl ErrorKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ErrorKind::InvalidMessage),
            1 => Some(ErrorKind::UnknownEntity),
            2 => Some(ErrorKind::UnknownSource),
            3 => Some(ErrorKind::NotFound),
            4 => Some(ErrorKind::Unavailable),
            5 => Some(ErrorKind::Conflict),
            6 => Some(ErrorKind::DiffMismatch),
            7 => Some(ErrorKind::Cancelled),
            8 => Some(ErrorKind::Internal),
            _ => None,
        }
    }

    /// Rebuild an error from its wire representation.
    pub fn with_message(self, message: String) -> ReconcileError {
        match self {
            ErrorKind::InvalidMessage => ReconcileError::InvalidMessage(message),
            ErrorKind::UnknownEntity => ReconcileError::UnknownEntity(message),
            ErrorKind::UnknownSource => ReconcileError::UnknownSource(message),
            ErrorKind::NotFound => ReconcileError::NotFound(message),
            ErrorKind::Unavailable => ReconcileError::Unavailable(message),
            ErrorKind::Conflict => ReconcileError::Conflict(message),
            ErrorKind::DiffMismatch => ReconcileError::DiffMismatch(message),
            ErrorKind::Cancelled => ReconcileError::Cancelled,
            ErrorKind::Internal => ReconcileError::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_round_trip() {
        for tag in 0..=8u8 {
            let kind = ErrorKind::from_u8(tag).unwrap();
            assert_eq!(kind.as_u8(), tag);
        }
        assert!(ErrorKind::from_u8(9).is_none());
    }

    #[test]
    fn test_retryable() {
        assert!(ReconcileError::Unavailable("timeout".into()).is_retryable());
        assert!(!ReconcileError::NotFound("fk".into()).is_retryable());
        assert!(!ReconcileError::Cancelled.is_retryable());
    }
}
