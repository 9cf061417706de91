use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hitl::HitlTask;
use crate::ids::{SessionId, ToolCallId};

/// Ordered natural-language steps for a non-trivial task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    pub steps: Vec<String>,
}

impl Plan {
    pub fn new(steps: Vec<String>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    /// Numbered rendering used in the system instruction.
    pub fn render(&self) -> String {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    #[default]
    Running,
    Completed,
    Pending,
    Truncated,
    Cancelled,
}

impl TraceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running | Self::Pending)
    }
}

/// One executed (or suspended) tool call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

/// One REASON step and the actions it produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub agent: String,
    pub index: u32,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionRecord>,
}

impl TraceStep {
    pub fn action_mut(&mut self, id: &ToolCallId) -> Option<&mut ActionRecord> {
        self.actions.iter_mut().find(|a| &a.tool_call_id == id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub steps: Vec<TraceStep>,
    #[serde(default)]
    pub status: TraceStatus,
    /// Model turns for a single agent, completed member invocations for a team.
    #[serde(default)]
    pub turn_count: u32,
}

impl Trace {
    pub fn is_pending(&self) -> bool {
        self.status == TraceStatus::Pending
    }

    pub fn last_step_mut(&mut self) -> Option<&mut TraceStep> {
        self.steps.last_mut()
    }

    /// Observation recorded for a tool call anywhere in the trace.
    pub fn observation_for(&self, id: &ToolCallId) -> Option<&str> {
        self.steps
            .iter()
            .flat_map(|s| s.actions.iter())
            .find(|a| &a.tool_call_id == id)
            .and_then(|a| a.observation.as_deref())
    }

    pub fn action_count(&self) -> usize {
        self.steps.iter().map(|s| s.actions.len()).sum()
    }

    /// Fold a member's trace into a team aggregate. Counts one member invocation.
    pub fn absorb(&mut self, member: Trace) {
        self.steps.extend(member.steps);
        if !member.plan.is_empty() {
            self.plan = member.plan;
        }
        self.turn_count += 1;
    }
}

/// Payload of the terminal event of a call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// `None` for ephemeral sessions.
    pub session_id: Option<SessionId>,
    pub agent: String,
    pub content: String,
    pub trace: Trace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_task: Option<HitlTask>,
}

impl Response {
    pub fn status(&self) -> TraceStatus {
        self.trace.status
    }

    pub fn is_pending(&self) -> bool {
        self.trace.is_pending()
    }

    pub fn is_truncated(&self) -> bool {
        self.trace.status == TraceStatus::Truncated
    }
}
