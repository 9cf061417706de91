//! The reasoning loop: plan, reason, act, observe, repeat.
//!
//! One call of [`AgentCore::run_loop`] drives a single turn until it finishes, pauses on
//! a HITL match, or fails. It never emits the terminal event; the caller does, after the
//! outcome is persisted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use troupe_core::checkpoint::RunCheckpoint;
use troupe_core::context::{LlmContext, SystemBlock, SystemBlockLabel};
use troupe_core::errors::GatewayError;
use troupe_core::events::AgentEvent;
use troupe_core::hitl::HitlTask;
use troupe_core::ids::RunId;
use troupe_core::messages::{
    strip_thinking, AssistantMessage, Message, ToolCallBlock, AGENT_KEY, STRIPPED_CONTENT_KEY,
};
use troupe_core::provider::{LlmProvider, StreamOptions};
use troupe_core::schema;
use troupe_core::stream::StreamEvent;
use troupe_core::tools::ToolContext;
use troupe_core::trace::{ActionRecord, Trace, TraceStatus, TraceStep};
use troupe_store::ResumableRun;

use crate::context::CallContext;
use crate::error::EngineError;
use crate::pipeline::{CallOutcome, Observation, ToolPipeline};
use crate::planner::{assess, PlanStrategy};
use crate::registry::{ToolFilter, ToolRegistry};
use crate::runtime::SessionHandle;
use crate::skills::SkillRegistry;
use crate::stream::EventSink;

pub const CANCELLED_NOTICE: &str = "Run cancelled";

/// Immutable configuration of one agent.
pub(crate) struct AgentCore {
    pub name: String,
    pub instruction: String,
    pub provider: Arc<dyn LlmProvider>,
    pub tools: ToolRegistry,
    pub skills: SkillRegistry,
    pub filters: Vec<ToolFilter>,
    pub pipeline: ToolPipeline,
    pub max_steps: u32,
    pub planning: bool,
    pub plan_strategy: PlanStrategy,
    pub output_key: Option<String>,
    pub output_schema: Option<Value>,
    pub model_timeout: Duration,
    pub stream_options: StreamOptions,
}

pub(crate) enum Turn {
    /// A new prompt. Team members after the first see the shared history only.
    Fresh { prompt: String, append_user: bool },
    Resumed(ResumableRun),
}

pub(crate) struct RunRequest {
    pub turn: Turn,
    pub handle: SessionHandle,
    pub attributes: BTreeMap<String, Value>,
    pub team_context: Option<String>,
}

pub(crate) enum LoopOutcome {
    /// Completed, truncated or cancelled, per `trace.status`. Already persisted.
    Done { content: String, trace: Trace },
    /// Suspended on a HITL match. The caller persists the checkpoint.
    Paused {
        task: HitlTask,
        checkpoint: RunCheckpoint,
        content: String,
        trace: Trace,
    },
    Failed(EngineError),
}

struct RunState {
    run_id: RunId,
    prompt: String,
    attributes: BTreeMap<String, Value>,
    call_ctx: CallContext,
    tools: ToolRegistry,
    skills_block: String,
    team_context: Option<String>,
    conversation: Vec<Message>,
    trace: Trace,
    step: u32,
}

enum ActOutcome {
    Continue,
    Paused {
        task: HitlTask,
        remaining: Vec<ToolCallBlock>,
    },
    Cancelled,
}

impl AgentCore {
    #[instrument(skip_all, fields(agent = %self.name, session_id = %req.handle.id))]
    pub(crate) async fn run_loop(
        &self,
        req: RunRequest,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> LoopOutcome {
        let handle = req.handle.clone();
        match self.run_inner(req, sink, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(agent = %self.name, session_id = %handle.id, error = %e, "run failed");
                LoopOutcome::Failed(e)
            }
        }
    }

    async fn run_inner(
        &self,
        req: RunRequest,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, EngineError> {
        let RunRequest {
            turn,
            handle,
            attributes,
            team_context,
        } = req;

        match turn {
            Turn::Fresh {
                prompt,
                append_user,
            } => {
                if append_user {
                    handle
                        .store
                        .append(&handle.id, Message::user_text(prompt.as_str()))?;
                }
                let mut state = self.prepare(
                    RunId::new(),
                    prompt,
                    attributes,
                    team_context,
                    &handle,
                    Vec::new(),
                    Trace::default(),
                    0,
                );
                let _ = sink.emit(AgentEvent::RunStarted {
                    session_id: handle.id.clone(),
                    agent: self.name.clone(),
                    run_id: state.run_id.clone(),
                    resumed: false,
                });
                if self.planning && !self.plan(&mut state, &handle, sink, cancel).await? {
                    return self.cancelled(state, &handle);
                }
                self.cycle(state, &handle, sink, cancel).await
            }
            Turn::Resumed(run) => self.resume(run, attributes, team_context, &handle, sink, cancel).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare(
        &self,
        run_id: RunId,
        prompt: String,
        attributes: BTreeMap<String, Value>,
        team_context: Option<String>,
        handle: &SessionHandle,
        conversation: Vec<Message>,
        trace: Trace,
        step: u32,
    ) -> RunState {
        let call_ctx = CallContext {
            prompt: prompt.clone(),
            session_id: handle.public_id(),
            attributes: attributes.clone(),
        };
        let active = self.skills.activate(&call_ctx);
        let mut candidates = self.tools.clone();
        candidates.extend_from(&active.tools);
        let tools = candidates.filtered(&self.filters, &call_ctx);
        debug!(
            agent = %self.name,
            skills = ?active.names,
            tools = ?tools.names(),
            "turn prepared"
        );
        RunState {
            run_id,
            prompt,
            attributes,
            call_ctx,
            tools,
            skills_block: active.instructions,
            team_context,
            conversation,
            trace,
            step,
        }
    }

    /// Plans a non-trivial turn. `false` when cancelled while planning.
    ///
    /// A planner that outlives the model timeout degrades to no plan.
    async fn plan(
        &self,
        state: &mut RunState,
        handle: &SessionHandle,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        let assessment = assess(&state.prompt, &state.tools.names());
        if assessment.is_trivial() {
            if handle.store.clear_plan(&handle.id)? {
                debug!(agent = %self.name, "trivial turn, cleared previous plan");
            }
            return Ok(true);
        }
        let planning = self.plan_strategy.plan(&state.prompt, &assessment);
        let plan = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(false),
            result = tokio::time::timeout(self.model_timeout, planning) => match result {
                Ok(plan) => plan,
                Err(_) => {
                    warn!(
                        agent = %self.name,
                        timeout_ms = u64::try_from(self.model_timeout.as_millis()).unwrap_or(u64::MAX),
                        "planning timed out, continuing without a plan"
                    );
                    return Ok(true);
                }
            },
        };
        if plan.is_empty() {
            return Ok(true);
        }
        info!(agent = %self.name, steps = plan.steps.len(), "plan created");
        let _ = sink.emit(AgentEvent::PlanCreated {
            session_id: handle.id.clone(),
            agent: self.name.clone(),
            plan: plan.clone(),
        });
        state.trace.plan = plan;
        Ok(true)
    }

    async fn resume(
        &self,
        run: ResumableRun,
        attributes: BTreeMap<String, Value>,
        team_context: Option<String>,
        handle: &SessionHandle,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, EngineError> {
        let ResumableRun {
            task,
            decision,
            checkpoint,
        } = run;
        // A restarted process has no caller attributes; use the paused call's.
        let attributes = if attributes.is_empty() {
            checkpoint.attributes
        } else {
            attributes
        };
        let mut trace = checkpoint.trace;
        trace.status = TraceStatus::Running;
        let mut state = self.prepare(
            checkpoint.run_id,
            checkpoint.prompt,
            attributes,
            team_context,
            handle,
            checkpoint.conversation,
            trace,
            checkpoint.step,
        );

        let _ = sink.emit(AgentEvent::RunStarted {
            session_id: handle.id.clone(),
            agent: self.name.clone(),
            run_id: state.run_id.clone(),
            resumed: true,
        });
        let _ = sink.emit(AgentEvent::ActionResumed {
            session_id: handle.id.clone(),
            agent: self.name.clone(),
            tool_call_id: task.tool_call_id.clone(),
            tool_name: task.tool_name.clone(),
            outcome: decision.outcome,
        });
        info!(
            agent = %self.name,
            tool = %task.tool_name,
            outcome = ?decision.outcome,
            "resuming paused run"
        );

        let tool_ctx = self.tool_context(handle, cancel);
        let resumed = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            obs = self.pipeline.resume(&task, &decision, &state.tools, &tool_ctx, &state.call_ctx) => Some(obs),
        };
        let Some(observation) = resumed else {
            return self.cancelled(state, handle);
        };
        self.record_observation(&mut state, observation, handle, sink);

        let remaining: Vec<ToolCallBlock> = checkpoint
            .pending_calls
            .into_iter()
            .filter(|c| c.id != task.tool_call_id)
            .collect();
        match self.act(&mut state, remaining, handle, sink, cancel).await {
            ActOutcome::Continue => self.cycle(state, handle, sink, cancel).await,
            ActOutcome::Paused { task, remaining } => Ok(self.paused(state, task, remaining)),
            ActOutcome::Cancelled => self.cancelled(state, handle),
        }
    }

    /// REASON ↔ ACT until a final answer, a pause, the step guard or cancellation.
    async fn cycle(
        &self,
        mut state: RunState,
        handle: &SessionHandle,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, EngineError> {
        loop {
            if cancel.is_cancelled() {
                return self.cancelled(state, handle);
            }
            if state.step >= self.max_steps {
                return self.truncated(state, handle);
            }
            state.step += 1;

            let context = self.build_context(&state, handle)?;
            let Some(message) = self.reason(&state, &context, handle, sink, cancel).await? else {
                return self.cancelled(state, handle);
            };
            state.trace.turn_count += 1;
            state.trace.steps.push(TraceStep {
                agent: self.name.clone(),
                index: state.step,
                reasoning: message.text_content(),
                actions: Vec::new(),
            });

            let calls: Vec<ToolCallBlock> = message.tool_calls().into_iter().cloned().collect();
            if calls.is_empty() {
                return self.finish(state, message, handle);
            }
            state.conversation.push(Message::Assistant(message));
            match self.act(&mut state, calls, handle, sink, cancel).await {
                ActOutcome::Continue => {}
                ActOutcome::Paused { task, remaining } => {
                    return Ok(self.paused(state, task, remaining))
                }
                ActOutcome::Cancelled => return self.cancelled(state, handle),
            }
        }
    }

    fn build_context(&self, state: &RunState, handle: &SessionHandle) -> Result<LlmContext, EngineError> {
        let mut system_blocks = Vec::new();
        if !self.instruction.trim().is_empty() {
            system_blocks.push(SystemBlock::new(
                SystemBlockLabel::AgentInstruction,
                self.instruction.as_str(),
            ));
        }
        if let Some(team) = &state.team_context {
            system_blocks.push(SystemBlock::new(SystemBlockLabel::TeamContext, team.as_str()));
        }
        if !state.skills_block.is_empty() {
            system_blocks.push(SystemBlock::new(
                SystemBlockLabel::SkillContext,
                state.skills_block.as_str(),
            ));
        }
        if !state.trace.plan.is_empty() {
            system_blocks.push(SystemBlock::new(
                SystemBlockLabel::Plan,
                format!("Plan:\n{}", state.trace.plan.render()),
            ));
        }
        let mut messages = handle.store.history(&handle.id)?;
        messages.extend(state.conversation.iter().cloned());
        Ok(LlmContext {
            messages,
            system_blocks,
            tools: state.tools.definitions(),
        })
    }

    /// One model invocation. `None` when cancelled mid-stream.
    async fn reason(
        &self,
        state: &RunState,
        context: &LlmContext,
        handle: &SessionHandle,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Option<AssistantMessage>, EngineError> {
        let invocation = self.stream_reply(state.step, context, handle, sink);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(None),
            result = tokio::time::timeout(self.model_timeout, invocation) => match result {
                Ok(Ok(message)) => Ok(Some(message)),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => {
                    warn!(
                        agent = %self.name,
                        timeout_ms = u64::try_from(self.model_timeout.as_millis()).unwrap_or(u64::MAX),
                        "model invocation timed out"
                    );
                    Err(GatewayError::Timeout(self.model_timeout).into())
                }
            },
        }
    }

    async fn stream_reply(
        &self,
        step: u32,
        context: &LlmContext,
        handle: &SessionHandle,
        sink: &EventSink,
    ) -> Result<AssistantMessage, GatewayError> {
        let mut stream = self.provider.stream(context, &self.stream_options).await?;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta { delta } => {
                    let _ = sink.emit(AgentEvent::ReasoningDelta {
                        session_id: handle.id.clone(),
                        agent: self.name.clone(),
                        step,
                        delta,
                    });
                }
                StreamEvent::ThinkingDelta { delta } => {
                    let _ = sink.emit(AgentEvent::ThinkingDelta {
                        session_id: handle.id.clone(),
                        agent: self.name.clone(),
                        step,
                        delta,
                    });
                }
                StreamEvent::Done { message, .. } => return Ok(message),
                StreamEvent::Error { error } => return Err(error),
                StreamEvent::Start | StreamEvent::ToolCallEnd { .. } => {}
            }
        }
        Err(GatewayError::StreamInterrupted(
            "stream ended without a final message".into(),
        ))
    }

    /// Run a batch of calls in order through the pipeline.
    async fn act(
        &self,
        state: &mut RunState,
        calls: Vec<ToolCallBlock>,
        handle: &SessionHandle,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> ActOutcome {
        let tool_ctx = self.tool_context(handle, cancel);
        let mut calls = calls.into_iter();
        while let Some(call) = calls.next() {
            if cancel.is_cancelled() {
                return ActOutcome::Cancelled;
            }
            let _ = sink.emit(AgentEvent::ActionStarted {
                session_id: handle.id.clone(),
                agent: self.name.clone(),
                step: state.step,
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
            if let Some(step) = state.trace.last_step_mut() {
                step.actions.push(ActionRecord {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    observation: None,
                    is_error: false,
                });
            }

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                outcome = self.pipeline.run(&call, &state.tools, &tool_ctx, &state.call_ctx) => Some(outcome),
            };
            match outcome {
                None => {
                    debug!(tool = %call.name, "cancelled during tool execution, result discarded");
                    return ActOutcome::Cancelled;
                }
                Some(CallOutcome::Completed(observation)) => {
                    self.record_observation(state, observation, handle, sink);
                }
                Some(CallOutcome::Suspended(task)) => {
                    info!(
                        agent = %self.name,
                        tool = %task.tool_name,
                        "tool call held for approval"
                    );
                    let mut remaining = vec![call];
                    remaining.extend(calls);
                    return ActOutcome::Paused { task, remaining };
                }
            }
        }
        ActOutcome::Continue
    }

    fn record_observation(
        &self,
        state: &mut RunState,
        observation: Observation,
        handle: &SessionHandle,
        sink: &EventSink,
    ) {
        if let Some(action) = state
            .trace
            .steps
            .iter_mut()
            .rev()
            .find_map(|s| s.action_mut(&observation.tool_call_id))
        {
            action.observation = Some(observation.content.clone());
            action.is_error = observation.is_error;
        }
        state.conversation.push(Message::tool_result(
            observation.tool_call_id.clone(),
            observation.tool_name.as_str(),
            observation.content.as_str(),
            observation.is_error,
        ));
        let _ = sink.emit(AgentEvent::Observation {
            session_id: handle.id.clone(),
            agent: self.name.clone(),
            step: state.step,
            tool_call_id: observation.tool_call_id,
            tool_name: observation.tool_name,
            content: observation.content,
            is_error: observation.is_error,
            duration_ms: u64::try_from(observation.duration.as_millis()).unwrap_or(u64::MAX),
        });
    }

    fn tool_context(&self, handle: &SessionHandle, cancel: &CancellationToken) -> ToolContext {
        ToolContext {
            session_id: handle.id.clone(),
            agent: self.name.clone(),
            abort_signal: cancel.clone(),
        }
    }

    fn finish(
        &self,
        mut state: RunState,
        message: AssistantMessage,
        handle: &SessionHandle,
    ) -> Result<LoopOutcome, EngineError> {
        let raw = message.text_content();
        let content = strip_thinking(&raw);
        let stored = AssistantMessage::text(raw)
            .with_metadata(AGENT_KEY, self.name.as_str())
            .with_metadata(STRIPPED_CONTENT_KEY, content.as_str());
        handle.store.append(&handle.id, Message::Assistant(stored))?;

        if let Some(key) = &self.output_key {
            if let Some(value) = self.output_value(&content) {
                handle.store.snapshot_put(&handle.id, key, value)?;
            }
        }

        state.trace.status = TraceStatus::Completed;
        handle.store.set_last_trace(&handle.id, state.trace.clone())?;
        info!(agent = %self.name, steps = state.step, "run completed");
        Ok(LoopOutcome::Done {
            content,
            trace: state.trace,
        })
    }

    /// Value written under the output key, or `None` when extraction or validation fails.
    fn output_value(&self, content: &str) -> Option<Value> {
        let Some(schema) = &self.output_schema else {
            return Some(Value::String(content.to_string()));
        };
        let Some(value) = extract_json(content) else {
            warn!(agent = %self.name, "no JSON found in answer, output not stored");
            return None;
        };
        match schema::validate(schema, &value) {
            Ok(()) => Some(value),
            Err(reason) => {
                warn!(agent = %self.name, %reason, "answer failed output schema, output not stored");
                None
            }
        }
    }

    fn truncated(&self, mut state: RunState, handle: &SessionHandle) -> Result<LoopOutcome, EngineError> {
        let partial = state
            .trace
            .steps
            .iter()
            .rev()
            .map(|s| strip_thinking(&s.reasoning))
            .find(|r| !r.is_empty())
            .unwrap_or_default();
        let marker = format!("[truncated: step limit of {} reached]", self.max_steps);
        let content = if partial.is_empty() {
            marker
        } else {
            format!("{partial}\n\n{marker}")
        };
        warn!(agent = %self.name, max_steps = self.max_steps, "step limit reached");

        let stored = AssistantMessage::text(content.as_str())
            .with_metadata(AGENT_KEY, self.name.as_str())
            .with_metadata(STRIPPED_CONTENT_KEY, content.as_str())
            .with_metadata("truncated", true);
        handle.store.append(&handle.id, Message::Assistant(stored))?;
        state.trace.status = TraceStatus::Truncated;
        handle.store.set_last_trace(&handle.id, state.trace.clone())?;
        Ok(LoopOutcome::Done {
            content,
            trace: state.trace,
        })
    }

    fn cancelled(&self, mut state: RunState, handle: &SessionHandle) -> Result<LoopOutcome, EngineError> {
        info!(agent = %self.name, session_id = %handle.id, "run cancelled");
        let notice = AssistantMessage::text(CANCELLED_NOTICE)
            .with_metadata(AGENT_KEY, self.name.as_str())
            .with_metadata("cancelled", true);
        handle.store.append(&handle.id, Message::Assistant(notice))?;
        state.trace.status = TraceStatus::Cancelled;
        handle.store.set_last_trace(&handle.id, state.trace.clone())?;
        Ok(LoopOutcome::Done {
            content: CANCELLED_NOTICE.to_string(),
            trace: state.trace,
        })
    }

    fn paused(&self, mut state: RunState, task: HitlTask, remaining: Vec<ToolCallBlock>) -> LoopOutcome {
        state.trace.status = TraceStatus::Pending;
        let content = format!(
            "Awaiting approval for {}: {}",
            task.tool_name, task.justification
        );
        let checkpoint = RunCheckpoint {
            run_id: state.run_id,
            agent: self.name.clone(),
            prompt: state.prompt,
            conversation: state.conversation,
            pending_calls: remaining,
            trace: state.trace.clone(),
            step: state.step,
            next_seq: 0,
            attributes: state.attributes,
        };
        LoopOutcome::Paused {
            task,
            checkpoint,
            content,
            trace: state.trace,
        }
    }
}

/// JSON object or array from an answer: a fenced ```json block, the whole text, or the
/// outermost `{...}` span.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            if let Ok(value) = serde_json::from_str(body[..end].trim()) {
                return Some(value);
            }
        }
    }
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_fenced_json() {
        let text = "Here you go:\n```json\n{\"temp\": 21}\n```\nanything else?";
        assert_eq!(extract_json(text), Some(json!({"temp": 21})));
    }

    #[test]
    fn extract_bare_and_embedded_json() {
        assert_eq!(extract_json(" [1, 2] "), Some(json!([1, 2])));
        assert_eq!(
            extract_json("The result is {\"ok\": true} as requested."),
            Some(json!({"ok": true}))
        );
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} backwards {"), None);
        assert_eq!(extract_json("42"), None);
    }
}
