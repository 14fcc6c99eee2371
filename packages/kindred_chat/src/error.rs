//! Error types, error codes, and recovery hints for the chat layer.

use kindred_realtime::RealtimeError;
use serde::{Deserialize, Serialize};

/// What the caller can do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Transient; re-invoking the triggering action may succeed
    Retry,
    /// Rejected input; retrying unchanged will fail again
    None,
    /// Unexpected state; rebuild the view from scratch
    Reload,
}

/// Failures reported by a [`crate::backend::Backend`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("{table} row not found: {id}")]
    NotFound { table: String, id: String },

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("unknown procedure: {0}")]
    UnknownProcedure(String),

    #[error("malformed row: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Unavailable(_) => "backend_unavailable",
            Self::NotFound { .. } => "not_found",
            Self::Rejected(_) => "rejected",
            Self::UnknownProcedure(_) => "unknown_procedure",
            Self::Decode(_) => "decode",
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChatError {
    /// Rejected before any network call
    #[error("invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

impl ChatError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Validation(_) => "validation",
            Self::Backend(e) => e.error_code(),
            Self::Realtime(e) => e.error_code(),
        }
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self {
            Self::Validation(_) => RecoveryAction::None,
            Self::Backend(BackendError::Unavailable(_)) => RecoveryAction::Retry,
            Self::Backend(BackendError::NotFound { .. }) => RecoveryAction::Reload,
            Self::Backend(BackendError::Rejected(_)) => RecoveryAction::None,
            Self::Backend(BackendError::UnknownProcedure(_) | BackendError::Decode(_)) => {
                RecoveryAction::Reload
            }
            Self::Realtime(e) if e.is_transient() => RecoveryAction::Retry,
            Self::Realtime(_) => RecoveryAction::Reload,
        }
    }

    /// Whether a caller should keep the current view and offer a retry
    pub fn is_recoverable(&self) -> bool {
        self.recovery() == RecoveryAction::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(
            ChatError::Validation("empty message".into()).error_code(),
            "validation"
        );
        assert_eq!(
            ChatError::from(BackendError::Unavailable("timeout".into())).error_code(),
            "backend_unavailable"
        );
        assert_eq!(
            ChatError::from(RealtimeError::ActorStopped("typing debouncer")).error_code(),
            "actor_stopped"
        );
    }

    #[test]
    fn recovery_hints() {
        assert_eq!(
            ChatError::Validation("x".into()).recovery(),
            RecoveryAction::None
        );
        assert!(ChatError::from(BackendError::Unavailable("down".into())).is_recoverable());
        assert_eq!(
            ChatError::from(RealtimeError::ActorStopped("typing debouncer")).recovery(),
            RecoveryAction::Reload
        );
        assert_eq!(
            ChatError::from(RealtimeError::ChannelClosed("chat_1".into())).recovery(),
            RecoveryAction::Retry
        );
    }

    #[test]
    fn decode_errors_from_serde() {
        let err: BackendError = serde_json::from_str::<u32>("\"nope\"").unwrap_err().into();
        assert_eq!(err.error_code(), "decode");
    }

    #[test]
    fn recovery_serialization() {
        let json = serde_json::to_string(&RecoveryAction::Retry).unwrap();
        assert_eq!(json, "\"retry\"");
    }
}
