use troupe_core::errors::GatewayError;
use troupe_core::ids::SessionId;
use troupe_core::tools::InvalidTool;
use troupe_store::StoreError;

use crate::settings::SettingsError;

/// Errors surfaced to callers of agents and teams.
///
/// Tool failures never appear here; they become observations inside the loop.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("invalid tool: {0}")]
    InvalidTool(#[from] InvalidTool),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("session busy: {0}")]
    SessionBusy(SessionId),

    #[error("session {0} is paused awaiting a decision")]
    AwaitingDecision(SessionId),

    #[error("session {0} has no paused run to resume")]
    NothingToResume(SessionId),

    #[error("pending task is for {expected}, not {got}")]
    DecisionMismatch { expected: String, got: String },

    #[error("session {session} is paused inside {owner}")]
    ForeignRun { session: SessionId, owner: String },

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Error category string for event emission and logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Gateway(e) => e.error_kind(),
            Self::Store(_) => "store",
            Self::Settings(_) => "settings",
            Self::InvalidTool(_) | Self::Config(_) => "config",
            Self::SessionBusy(_) => "session_busy",
            Self::AwaitingDecision(_) => "awaiting_decision",
            Self::NothingToResume(_) => "nothing_to_resume",
            Self::DecisionMismatch { .. } => "decision_mismatch",
            Self::ForeignRun { .. } => "foreign_run",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the caller can reasonably retry the same request later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Gateway(e) => e.is_retryable() || matches!(e, GatewayError::Timeout(_)),
            Self::SessionBusy(_) | Self::AwaitingDecision(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn categories() {
        let err = EngineError::from(GatewayError::Timeout(Duration::from_secs(1)));
        assert_eq!(err.category(), "timeout");
        assert!(err.is_recoverable());

        let err = EngineError::SessionBusy(SessionId::from_raw("s"));
        assert_eq!(err.category(), "session_busy");
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "session busy: s");

        let err = EngineError::Config("empty team".into());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn store_errors_convert() {
        let err: EngineError = StoreError::NoPendingTask(SessionId::from_raw("s")).into();
        assert_eq!(err.category(), "store");
    }
}
