use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::RunId;
use crate::messages::{Message, ToolCallBlock};
use crate::trace::Trace;

/// Everything a paused reasoning loop needs to continue, possibly in another process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run_id: RunId,
    pub agent: String,
    /// Prompt of the turn, kept for skill re-evaluation on resume.
    pub prompt: String,
    /// Tool-call messages and observations produced since the turn started.
    pub conversation: Vec<Message>,
    /// Calls of the suspended batch that have not run yet. The first one is the suspended call.
    pub pending_calls: Vec<ToolCallBlock>,
    pub trace: Trace,
    pub step: u32,
    pub next_seq: u64,
    /// Caller attributes of the paused call, for skill and filter re-evaluation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

/// Position of a team run paused inside one of its members.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TeamProgress {
    pub team: String,
    pub awaiting_index: usize,
    pub awaiting_member: String,
    pub trace: Trace,
    pub last_content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceStatus;
    use serde_json::json;

    #[test]
    fn checkpoint_survives_json() {
        let call = ToolCallBlock::new("delete_file", json!({"path": "/tmp/x"}));
        let checkpoint = RunCheckpoint {
            run_id: RunId::new(),
            agent: "ops".into(),
            prompt: "clean up".into(),
            conversation: vec![
                Message::tool_result(call.id.clone(), "list", "a, b", false),
            ],
            pending_calls: vec![call],
            trace: Trace {
                status: TraceStatus::Pending,
                ..Trace::default()
            },
            step: 2,
            next_seq: 9,
            attributes: BTreeMap::from([("role".to_string(), json!("ops"))]),
        };
        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: RunCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, checkpoint);
    }
}
