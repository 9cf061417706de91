use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument};

use troupe_core::checkpoint::TeamProgress;
use troupe_core::hitl::{HitlDecision, HitlTask};
use troupe_core::ids::SessionId;
use troupe_core::messages::Message;
use troupe_core::trace::Trace;

use crate::error::{Result, StoreError};
use crate::session::{ResumableRun, Session, SuspendedRun, DEFAULT_MAX_HISTORY};
use crate::store::SessionStore;

/// Reference [`SessionStore`]: a sharded map of per-session locks.
///
/// Sessions can be exported and imported as [`Session`] documents, which is how a
/// durable backend persists them between processes.
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    default_max_history: usize,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_default_max_history(DEFAULT_MAX_HISTORY)
    }

    pub fn with_default_max_history(max_history: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            default_max_history: max_history.max(1),
        }
    }

    pub fn default_max_history(&self) -> usize {
        self.default_max_history
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Copy of the full session document.
    pub fn export(&self, id: &SessionId) -> Option<Session> {
        let cell = self.sessions.get(id).map(|c| Arc::clone(c.value()))?;
        let session = cell.lock().clone();
        Some(session)
    }

    /// Install a session document, replacing any session with the same id.
    pub fn import(&self, session: Session) -> Result<()> {
        if session.max_history == 0 {
            return Err(StoreError::InvalidBound(0));
        }
        debug!(session_id = %session.id, "session imported");
        let _ = self
            .sessions
            .insert(session.id.clone(), Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// Delete a session. Sessions are caller-owned; nothing removes them implicitly.
    pub fn remove(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    fn cell(&self, id: &SessionId) -> Arc<Mutex<Session>> {
        // Clone the Arc out so the shard lock is released before the session lock is taken.
        let entry = self.sessions.entry(id.clone()).or_insert_with(|| {
            debug!(session_id = %id, "session created");
            Arc::new(Mutex::new(Session::new(id.clone(), self.default_max_history)))
        });
        Arc::clone(entry.value())
    }

    fn with_session<T>(&self, id: &SessionId, f: impl FnOnce(&mut Session) -> T) -> T {
        let cell = self.cell(id);
        let mut session = cell.lock();
        f(&mut session)
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, id: &SessionId) -> Result<Session> {
        Ok(self.with_session(id, |s| s.clone()))
    }

    #[instrument(skip(self), fields(session_id = %id))]
    fn create(&self, id: &SessionId, max_history: usize) -> Result<Session> {
        if max_history == 0 {
            return Err(StoreError::InvalidBound(max_history));
        }
        match self.sessions.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::Conflict(format!("session {id} already exists")))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let session = Session::new(id.clone(), max_history);
                let _ = slot.insert(Arc::new(Mutex::new(session.clone())));
                Ok(session)
            }
        }
    }

    fn exists(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    fn append(&self, id: &SessionId, message: Message) -> Result<()> {
        let kept = self.with_session(id, |s| s.append(message));
        if !kept {
            debug!(session_id = %id, "system message not persisted");
        }
        Ok(())
    }

    fn history(&self, id: &SessionId) -> Result<Vec<Message>> {
        Ok(self.with_session(id, |s| s.history()))
    }

    fn snapshot_put(&self, id: &SessionId, key: &str, value: Value) -> Result<()> {
        self.with_session(id, |s| {
            let _ = s.snapshot.insert(key.to_string(), value);
            s.touch();
        });
        Ok(())
    }

    fn snapshot_get(&self, id: &SessionId, key: &str) -> Result<Option<Value>> {
        Ok(self.with_session(id, |s| s.snapshot.get(key).cloned()))
    }

    fn pending_task(&self, id: &SessionId) -> Result<Option<HitlTask>> {
        Ok(self.with_session(id, |s| s.pending_task().cloned()))
    }

    #[instrument(skip(self, run), fields(session_id = %id, tool = %run.task.tool_name))]
    fn suspend(&self, id: &SessionId, run: SuspendedRun) -> Result<()> {
        self.with_session(id, |s| {
            if let Some(existing) = &s.pending {
                return Err(StoreError::Conflict(format!(
                    "session {id} already has a pending task for {}",
                    existing.task.tool_name
                )));
            }
            if s.resolved.is_some() {
                return Err(StoreError::Conflict(format!(
                    "session {id} has a decided run that was not resumed"
                )));
            }
            s.pending = Some(run);
            s.touch();
            Ok(())
        })
    }

    #[instrument(skip(self, decision), fields(session_id = %id, outcome = ?decision.outcome))]
    fn resolve_pending(&self, id: &SessionId, decision: HitlDecision) -> Result<HitlTask> {
        self.with_session(id, |s| {
            let SuspendedRun { task, checkpoint } =
                s.pending.take().ok_or_else(|| StoreError::NoPendingTask(id.clone()))?;
            s.resolved = Some(ResumableRun {
                task: task.clone(),
                decision,
                checkpoint,
            });
            s.touch();
            Ok(task)
        })
    }

    fn has_resumable(&self, id: &SessionId) -> Result<bool> {
        Ok(self.with_session(id, |s| s.resolved.is_some()))
    }

    fn take_resumable(&self, id: &SessionId) -> Result<Option<ResumableRun>> {
        Ok(self.with_session(id, |s| {
            let taken = s.resolved.take();
            if taken.is_some() {
                s.touch();
            }
            taken
        }))
    }

    fn restore_resumable(&self, id: &SessionId, run: ResumableRun) -> Result<()> {
        self.with_session(id, |s| {
            if s.pending.is_some() || s.resolved.is_some() {
                return Err(StoreError::Conflict(format!(
                    "session {id} paused again, decided run for {} not restored",
                    run.task.tool_name
                )));
            }
            s.resolved = Some(run);
            s.touch();
            Ok(())
        })
    }

    fn last_trace(&self, id: &SessionId) -> Result<Option<Trace>> {
        Ok(self.with_session(id, |s| s.last_trace.clone()))
    }

    fn set_last_trace(&self, id: &SessionId, trace: Trace) -> Result<()> {
        self.with_session(id, |s| {
            s.last_trace = Some(trace);
            s.touch();
        });
        Ok(())
    }

    fn clear_plan(&self, id: &SessionId) -> Result<bool> {
        Ok(self.with_session(id, |s| match s.last_trace.as_mut() {
            Some(trace) if !trace.plan.is_empty() => {
                trace.plan.clear();
                s.touch();
                true
            }
            _ => false,
        }))
    }

    fn team_progress(&self, id: &SessionId) -> Result<Option<TeamProgress>> {
        Ok(self.with_session(id, |s| s.team_progress.clone()))
    }

    fn set_team_progress(&self, id: &SessionId, progress: Option<TeamProgress>) -> Result<()> {
        self.with_session(id, |s| {
            s.team_progress = progress;
            s.touch();
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use troupe_core::checkpoint::RunCheckpoint;
    use troupe_core::ids::{RunId, TaskId, ToolCallId};
    use troupe_core::messages::ToolCallBlock;
    use troupe_core::trace::{Plan, TraceStatus};

    fn sid(s: &str) -> SessionId {
        SessionId::from_raw(s)
    }

    fn suspended(id: &SessionId, tool: &str) -> SuspendedRun {
        let call = ToolCallBlock {
            id: ToolCallId::from_raw("call_1"),
            name: tool.into(),
            arguments: json!({"path": "/etc"}),
        };
        SuspendedRun {
            task: HitlTask {
                id: TaskId::new(),
                session_id: id.clone(),
                agent: "ops".into(),
                tool_call_id: call.id.clone(),
                tool_name: tool.into(),
                arguments: call.arguments.clone(),
                justification: "destructive".into(),
                created_at: Utc::now(),
            },
            checkpoint: RunCheckpoint {
                run_id: RunId::new(),
                agent: "ops".into(),
                prompt: "clean".into(),
                conversation: Vec::new(),
                pending_calls: vec![call],
                trace: Trace {
                    status: TraceStatus::Pending,
                    ..Trace::default()
                },
                step: 1,
                next_seq: 4,
                attributes: Default::default(),
            },
        }
    }

    #[test]
    fn get_creates_with_default_bound() {
        let store = InMemorySessionStore::with_default_max_history(7);
        assert!(!store.exists(&sid("a")));
        let session = store.get(&sid("a")).unwrap();
        assert_eq!(session.max_history, 7);
        assert!(session.is_empty());
        assert!(store.exists(&sid("a")));
    }

    #[test]
    fn create_rejects_duplicates_and_zero_bound() {
        let store = InMemorySessionStore::new();
        store.create(&sid("a"), 2).unwrap();
        assert!(matches!(store.create(&sid("a"), 2), Err(StoreError::Conflict(_))));
        assert!(matches!(store.create(&sid("b"), 0), Err(StoreError::InvalidBound(0))));
    }

    #[test]
    fn windowing_through_the_store() {
        let store = InMemorySessionStore::new();
        let id = sid("w");
        store.create(&id, 2).unwrap();
        store.append(&id, Message::user_text("U1")).unwrap();
        store.append(&id, Message::assistant_text("A1")).unwrap();
        store.append(&id, Message::system("ignored")).unwrap();
        store.append(&id, Message::user_text("U2")).unwrap();
        let texts: Vec<String> = store
            .history(&id)
            .unwrap()
            .iter()
            .map(|m| m.text_content())
            .collect();
        assert_eq!(texts, vec!["A1", "U2"]);
    }

    #[test]
    fn sessions_are_isolated() {
        let store = InMemorySessionStore::new();
        store.append(&sid("SA"), Message::user_text("for A")).unwrap();
        store.snapshot_put(&sid("SA"), "answer", json!(42)).unwrap();

        assert!(store.history(&sid("SB")).unwrap().is_empty());
        assert_eq!(store.snapshot_get(&sid("SB"), "answer").unwrap(), None);
        assert_eq!(store.snapshot_get(&sid("SA"), "answer").unwrap(), Some(json!(42)));
        assert_eq!(store.history(&sid("SA")).unwrap().len(), 1);
    }

    #[test]
    fn pending_task_lifecycle() {
        let store = InMemorySessionStore::new();
        let id = sid("h");
        assert!(store.pending_task(&id).unwrap().is_none());

        store.suspend(&id, suspended(&id, "delete_file")).unwrap();
        assert_eq!(
            store.pending_task(&id).unwrap().unwrap().tool_name,
            "delete_file"
        );
        assert!(matches!(
            store.suspend(&id, suspended(&id, "other")),
            Err(StoreError::Conflict(_))
        ));

        let task = store.resolve_pending(&id, HitlDecision::approve()).unwrap();
        assert_eq!(task.tool_name, "delete_file");
        assert!(store.pending_task(&id).unwrap().is_none());
        assert!(store.has_resumable(&id).unwrap());

        // A second resolution finds nothing to consume.
        assert!(matches!(
            store.resolve_pending(&id, HitlDecision::approve()),
            Err(StoreError::NoPendingTask(_))
        ));
        // Suspending again before the decided run resumes would lose it.
        assert!(matches!(
            store.suspend(&id, suspended(&id, "other")),
            Err(StoreError::Conflict(_))
        ));

        let run = store.take_resumable(&id).unwrap().unwrap();
        assert!(run.decision.is_approved());
        assert_eq!(run.checkpoint.next_seq, 4);
        assert!(store.take_resumable(&id).unwrap().is_none());
    }

    #[test]
    fn restore_returns_decided_run() {
        let store = InMemorySessionStore::new();
        let id = sid("r");
        store.suspend(&id, suspended(&id, "delete_file")).unwrap();
        store.resolve_pending(&id, HitlDecision::approve()).unwrap();
        let run = store.take_resumable(&id).unwrap().unwrap();

        store.restore_resumable(&id, run.clone()).unwrap();
        assert!(store.has_resumable(&id).unwrap());
        assert!(store.pending_task(&id).unwrap().is_none());

        // Never overwrites a newer pause.
        let taken = store.take_resumable(&id).unwrap().unwrap();
        store.suspend(&id, suspended(&id, "other")).unwrap();
        assert!(matches!(
            store.restore_resumable(&id, taken),
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.pending_task(&id).unwrap().unwrap().tool_name, "other");
        assert!(!store.has_resumable(&id).unwrap());
    }

    #[test]
    fn clear_plan_only_reports_real_changes() {
        let store = InMemorySessionStore::new();
        let id = sid("p");
        assert!(!store.clear_plan(&id).unwrap());
        store
            .set_last_trace(
                &id,
                Trace {
                    plan: Plan::new(vec!["a".into(), "b".into()]),
                    turn_count: 2,
                    ..Trace::default()
                },
            )
            .unwrap();
        assert!(store.clear_plan(&id).unwrap());
        let trace = store.last_trace(&id).unwrap().unwrap();
        assert!(trace.plan.is_empty());
        assert_eq!(trace.turn_count, 2);
        assert!(!store.clear_plan(&id).unwrap());
    }

    #[test]
    fn export_import_preserves_pause_state() {
        let store = InMemorySessionStore::new();
        let id = sid("x");
        store.append(&id, Message::user_text("hi")).unwrap();
        store.suspend(&id, suspended(&id, "delete_file")).unwrap();

        let json = serde_json::to_string(&store.export(&id).unwrap()).unwrap();
        let restored = InMemorySessionStore::new();
        restored.import(serde_json::from_str(&json).unwrap()).unwrap();

        assert_eq!(restored.history(&id).unwrap().len(), 1);
        assert_eq!(
            restored.pending_task(&id).unwrap().unwrap().tool_name,
            "delete_file"
        );
        assert!(store.export(&sid("missing")).is_none());
    }

    #[test]
    fn team_progress_slot() {
        let store = InMemorySessionStore::new();
        let id = sid("t");
        let progress = TeamProgress {
            team: "crew".into(),
            awaiting_index: 1,
            awaiting_member: "editor".into(),
            trace: Trace::default(),
            last_content: "draft".into(),
        };
        store.set_team_progress(&id, Some(progress.clone())).unwrap();
        assert_eq!(store.team_progress(&id).unwrap(), Some(progress));
        store.set_team_progress(&id, None).unwrap();
        assert_eq!(store.team_progress(&id).unwrap(), None);
    }

    #[test]
    fn concurrent_appends_respect_bound() {
        let store = Arc::new(InMemorySessionStore::with_default_max_history(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store
                            .append(&sid("shared"), Message::user_text(format!("{t}-{i}")))
                            .unwrap();
                        store
                            .append(&sid(&format!("own-{t}")), Message::user_text("x"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.history(&sid("shared")).unwrap().len(), 16);
        for t in 0..8 {
            assert_eq!(store.history(&sid(&format!("own-{t}"))).unwrap().len(), 16);
        }
    }
}
