use serde_json::Value;

use troupe_core::checkpoint::TeamProgress;
use troupe_core::hitl::{HitlDecision, HitlTask};
use troupe_core::ids::SessionId;
use troupe_core::messages::Message;
use troupe_core::trace::Trace;

use crate::error::Result;
use crate::session::{ResumableRun, Session, SuspendedRun};

/// Keyed conversation memory.
///
/// Every operation on one session id must be linearizable with respect to the others on
/// that id. Operations on different ids are independent.
pub trait SessionStore: Send + Sync {
    /// Fetch a session, creating it with the store's default bound if absent.
    fn get(&self, id: &SessionId) -> Result<Session>;

    /// Explicitly create a session with its own history bound.
    fn create(&self, id: &SessionId, max_history: usize) -> Result<Session>;

    fn exists(&self, id: &SessionId) -> bool;

    /// Append with FIFO eviction; system-role messages are silently dropped.
    fn append(&self, id: &SessionId, message: Message) -> Result<()>;

    fn history(&self, id: &SessionId) -> Result<Vec<Message>>;

    fn snapshot_put(&self, id: &SessionId, key: &str, value: Value) -> Result<()>;

    fn snapshot_get(&self, id: &SessionId, key: &str) -> Result<Option<Value>>;

    fn pending_task(&self, id: &SessionId) -> Result<Option<HitlTask>>;

    /// Record a paused run. Fails with a conflict if a task is already pending or a
    /// decided run has not been resumed yet.
    fn suspend(&self, id: &SessionId, run: SuspendedRun) -> Result<()>;

    /// Consume the pending task and record the decision for the next resume.
    fn resolve_pending(&self, id: &SessionId, decision: HitlDecision) -> Result<HitlTask>;

    fn has_resumable(&self, id: &SessionId) -> Result<bool>;

    /// Remove and return the decided run, if any.
    fn take_resumable(&self, id: &SessionId) -> Result<Option<ResumableRun>>;

    /// Put back a decided run whose resume did not complete. Fails with a conflict if
    /// the session has paused or been decided again since.
    fn restore_resumable(&self, id: &SessionId, run: ResumableRun) -> Result<()>;

    fn last_trace(&self, id: &SessionId) -> Result<Option<Trace>>;

    fn set_last_trace(&self, id: &SessionId, trace: Trace) -> Result<()>;

    /// Clear the plan of the last trace. Returns whether a non-empty plan was dropped.
    fn clear_plan(&self, id: &SessionId) -> Result<bool>;

    fn team_progress(&self, id: &SessionId) -> Result<Option<TeamProgress>>;

    fn set_team_progress(&self, id: &SessionId, progress: Option<TeamProgress>) -> Result<()>;
}
