use troupe_core::ids::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no pending task for session {0}")]
    NoPendingTask(SessionId),

    #[error("invalid history bound {0}: must be at least 1")]
    InvalidBound(usize),
}

pub type Result<T> = std::result::Result<T, StoreError>;
