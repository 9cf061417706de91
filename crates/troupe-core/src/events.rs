use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hitl::DecisionOutcome;
use crate::ids::{RunId, SessionId, ToolCallId};
use crate::trace::{Plan, Response, TraceStatus};

/// Events emitted while an agent or team call executes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    RunStarted {
        session_id: SessionId,
        agent: String,
        run_id: RunId,
        resumed: bool,
    },
    PlanCreated {
        session_id: SessionId,
        agent: String,
        plan: Plan,
    },
    ReasoningDelta {
        session_id: SessionId,
        agent: String,
        step: u32,
        delta: String,
    },
    ThinkingDelta {
        session_id: SessionId,
        agent: String,
        step: u32,
        delta: String,
    },
    ActionStarted {
        session_id: SessionId,
        agent: String,
        step: u32,
        tool_call_id: ToolCallId,
        tool_name: String,
        arguments: Value,
    },
    ActionResumed {
        session_id: SessionId,
        agent: String,
        tool_call_id: ToolCallId,
        tool_name: String,
        outcome: DecisionOutcome,
    },
    Observation {
        session_id: SessionId,
        agent: String,
        step: u32,
        tool_call_id: ToolCallId,
        tool_name: String,
        content: String,
        is_error: bool,
        duration_ms: u64,
    },
    MemberStarted {
        session_id: SessionId,
        team: String,
        member: String,
    },
    MemberSelected {
        session_id: SessionId,
        team: String,
        /// `None` when the supervisor concludes.
        member: Option<String>,
        rationale: String,
    },
    MemberFinished {
        session_id: SessionId,
        team: String,
        member: String,
        status: TraceStatus,
    },
    Finished {
        session_id: SessionId,
        response: Response,
    },
    Failed {
        session_id: SessionId,
        error_kind: String,
        message: String,
    },
}

impl AgentEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::RunStarted { session_id, .. }
            | Self::PlanCreated { session_id, .. }
            | Self::ReasoningDelta { session_id, .. }
            | Self::ThinkingDelta { session_id, .. }
            | Self::ActionStarted { session_id, .. }
            | Self::ActionResumed { session_id, .. }
            | Self::Observation { session_id, .. }
            | Self::MemberStarted { session_id, .. }
            | Self::MemberSelected { session_id, .. }
            | Self::MemberFinished { session_id, .. }
            | Self::Finished { session_id, .. }
            | Self::Failed { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::PlanCreated { .. } => "plan_created",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::ActionStarted { .. } => "action_started",
            Self::ActionResumed { .. } => "action_resumed",
            Self::Observation { .. } => "observation",
            Self::MemberStarted { .. } => "member_started",
            Self::MemberSelected { .. } => "member_selected",
            Self::MemberFinished { .. } => "member_finished",
            Self::Finished { .. } => "finished",
            Self::Failed { .. } => "failed",
        }
    }

    /// Exactly one terminal event ends every call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Failed { .. })
    }
}

/// An event with its position in the call's sequence.
/// Sequence numbers continue across a pause and its resume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    #[serde(flatten)]
    pub event: AgentEvent,
}
