use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use troupe_core::checkpoint::{RunCheckpoint, TeamProgress};
use troupe_core::hitl::{HitlDecision, HitlTask};
use troupe_core::ids::SessionId;
use troupe_core::messages::Message;
use troupe_core::trace::Trace;

pub const DEFAULT_MAX_HISTORY: usize = 50;

/// A loop paused on a HITL match, waiting for a decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuspendedRun {
    pub task: HitlTask,
    pub checkpoint: RunCheckpoint,
}

/// A paused loop whose decision has been recorded, ready to continue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumableRun {
    pub task: HitlTask,
    pub decision: HitlDecision,
    pub checkpoint: RunCheckpoint,
}

/// Everything persisted for one session id. Serializable as a whole, so any backend
/// that can store a JSON document per id can hold it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub max_history: usize,
    messages: VecDeque<Message>,
    #[serde(default)]
    pub snapshot: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<SuspendedRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<ResumableRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trace: Option<Trace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_progress: Option<TeamProgress>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, max_history: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            max_history,
            messages: VecDeque::with_capacity(max_history.min(DEFAULT_MAX_HISTORY)),
            snapshot: BTreeMap::new(),
            pending: None,
            resolved: None,
            last_trace: None,
            team_progress: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append with FIFO eviction. System messages are dropped; returns whether the
    /// message was kept.
    pub fn append(&mut self, message: Message) -> bool {
        if message.is_system() {
            return false;
        }
        self.messages.push_back(message);
        while self.messages.len() > self.max_history {
            let _ = self.messages.pop_front();
        }
        self.touch();
        true
    }

    pub fn history(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn pending_task(&self) -> Option<&HitlTask> {
        self.pending.as_ref().map(|p| &p.task)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(session: &Session) -> Vec<String> {
        session.history().iter().map(|m| m.text_content()).collect()
    }

    #[test]
    fn evicts_oldest_first() {
        let mut s = Session::new(SessionId::from_raw("s"), 2);
        assert!(s.append(Message::user_text("U1")));
        assert!(s.append(Message::assistant_text("A1")));
        assert!(s.append(Message::user_text("U2")));
        assert_eq!(texts(&s), vec!["A1", "U2"]);
    }

    #[test]
    fn bound_of_one_keeps_latest() {
        let mut s = Session::new(SessionId::from_raw("s"), 1);
        for i in 0..5 {
            s.append(Message::user_text(format!("m{i}")));
            assert_eq!(s.len(), 1);
        }
        assert_eq!(texts(&s), vec!["m4"]);
    }

    #[test]
    fn retained_suffix_matches_last_n_appends() {
        let n = 3;
        let mut s = Session::new(SessionId::from_raw("s"), n);
        let mut all = Vec::new();
        for i in 0..10 {
            let msg = if i % 3 == 0 {
                Message::system(format!("sys{i}"))
            } else {
                Message::user_text(format!("u{i}"))
            };
            if !msg.is_system() {
                all.push(msg.text_content());
            }
            s.append(msg);
            assert!(s.len() <= n);
            let expected: Vec<String> = all.iter().rev().take(n).rev().cloned().collect();
            assert_eq!(texts(&s), expected);
        }
    }

    #[test]
    fn system_messages_never_change_length() {
        let mut s = Session::new(SessionId::from_raw("s"), 4);
        s.append(Message::user_text("hi"));
        assert!(!s.append(Message::system("you are a bot")));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn session_serde_round_trip() {
        let mut s = Session::new(SessionId::from_raw("s"), 4);
        s.append(Message::user_text("hi"));
        s.snapshot.insert("k".into(), serde_json::json!(1));
        let json = serde_json::to_string(&s).unwrap();
        let parsed: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, s);
    }
}
