use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use troupe_core::events::AgentEvent;
use troupe_core::hitl::{HitlDecision, HitlTask};
use troupe_core::ids::SessionId;
use troupe_core::provider::{LlmProvider, StreamOptions};
use troupe_core::tools::{Tool, ToolProvider};
use troupe_core::trace::{Response, Trace};
use troupe_store::{ResumableRun, SuspendedRun};

use crate::error::EngineError;
use crate::pipeline::{HitlGate, Interceptor, ToolPipeline};
use crate::planner::PlanStrategy;
use crate::registry::{ToolFilter, ToolRegistry, ToolSource};
use crate::runner::{AgentCore, LoopOutcome, RunRequest, Turn};
use crate::runtime::{Runtime, SessionHandle};
use crate::skills::{Skill, SkillRegistry};
use crate::stream::{AgentStream, EventSink};

/// Per-call options beyond the prompt.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Signals for skill activation and tool filtering, e.g. `role`.
    pub attributes: BTreeMap<String, Value>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        let _ = self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// A single reasoning agent bound to a [`Runtime`].
#[derive(Clone)]
pub struct Agent {
    core: Arc<AgentCore>,
    runtime: Runtime,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.core.name)
            .field("model", &self.core.provider.model())
            .field("tools", &self.core.tools.names())
            .finish()
    }
}

impl Agent {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn core(&self) -> &Arc<AgentCore> {
        &self.core
    }

    /// Names of the agent's own tools, before skill activation.
    pub fn tool_names(&self) -> Vec<String> {
        self.core.tools.names()
    }

    pub async fn call(
        &self,
        prompt: &str,
        session: Option<&SessionId>,
    ) -> Result<Response, EngineError> {
        self.stream(prompt, session)?.into_response().await
    }

    pub async fn call_with(
        &self,
        prompt: &str,
        session: Option<&SessionId>,
        options: CallOptions,
    ) -> Result<Response, EngineError> {
        self.stream_with(prompt, session, options)?.into_response().await
    }

    pub async fn call_cancellable(
        &self,
        prompt: &str,
        session: Option<&SessionId>,
        cancel: CancellationToken,
    ) -> Result<Response, EngineError> {
        self.call_with(prompt, session, CallOptions::default().with_cancel(cancel))
            .await
    }

    /// Stream a turn's events.
    ///
    /// # Panics
    ///
    /// Spawns the run, so it panics if called outside a Tokio runtime.
    pub fn stream(
        &self,
        prompt: &str,
        session: Option<&SessionId>,
    ) -> Result<AgentStream, EngineError> {
        self.stream_with(prompt, session, CallOptions::default())
    }

    /// Like [`Agent::stream`], stopped early by `cancel`.
    ///
    /// # Panics
    ///
    /// Spawns the run, so it panics if called outside a Tokio runtime.
    pub fn stream_cancellable(
        &self,
        prompt: &str,
        session: Option<&SessionId>,
        cancel: CancellationToken,
    ) -> Result<AgentStream, EngineError> {
        self.stream_with(prompt, session, CallOptions::default().with_cancel(cancel))
    }

    /// Start a turn. A session holding a decided HITL task resumes that run instead and
    /// the prompt is ignored.
    ///
    /// # Panics
    ///
    /// Spawns the run, so it panics if called outside a Tokio runtime.
    pub fn stream_with(
        &self,
        prompt: &str,
        session: Option<&SessionId>,
        options: CallOptions,
    ) -> Result<AgentStream, EngineError> {
        self.start(Some(prompt), session, options)
    }

    pub async fn resume(&self, session: &SessionId) -> Result<Response, EngineError> {
        self.resume_stream(session)?.into_response().await
    }

    pub async fn resume_cancellable(
        &self,
        session: &SessionId,
        cancel: CancellationToken,
    ) -> Result<Response, EngineError> {
        self.resume_stream_cancellable(session, cancel)?
            .into_response()
            .await
    }

    /// Stream the resumed run of a decided session.
    ///
    /// # Panics
    ///
    /// Spawns the run, so it panics if called outside a Tokio runtime.
    pub fn resume_stream(&self, session: &SessionId) -> Result<AgentStream, EngineError> {
        self.start(None, Some(session), CallOptions::default())
    }

    /// Like [`Agent::resume_stream`], stopped early by `cancel`.
    ///
    /// # Panics
    ///
    /// Spawns the run, so it panics if called outside a Tokio runtime.
    pub fn resume_stream_cancellable(
        &self,
        session: &SessionId,
        cancel: CancellationToken,
    ) -> Result<AgentStream, EngineError> {
        self.start(
            None,
            Some(session),
            CallOptions::default().with_cancel(cancel),
        )
    }

    pub fn get_pending_task(&self, session: &SessionId) -> Result<Option<HitlTask>, EngineError> {
        Ok(self.runtime.store().pending_task(session)?)
    }

    /// Record a human decision for the session's pending task. Consumed by the next
    /// resume; a task is resolved at most once.
    pub fn submit_decision(
        &self,
        session: &SessionId,
        tool_name: &str,
        decision: HitlDecision,
    ) -> Result<HitlTask, EngineError> {
        submit_decision(&self.runtime, session, tool_name, decision)
    }

    pub fn is_pending(trace: &Trace) -> bool {
        trace.is_pending()
    }

    fn start(
        &self,
        prompt: Option<&str>,
        session: Option<&SessionId>,
        options: CallOptions,
    ) -> Result<AgentStream, EngineError> {
        let handle = SessionHandle::resolve(&self.runtime, session)?;
        let cancel = options.cancel.unwrap_or_default();
        let lease = self
            .runtime
            .active_runs()
            .try_acquire(&handle.id, cancel.clone())?;

        let resumable = claim_resumable(&handle, &self.core.name)?;
        let retained = resumable.clone();
        let (turn, start_seq) = match (resumable, prompt) {
            (Some(run), prompt) => {
                if prompt.is_some() {
                    debug!(session_id = %handle.id, "decided run pending, prompt ignored");
                }
                let seq = run.checkpoint.next_seq;
                (Turn::Resumed(run), seq)
            }
            (None, Some(prompt)) => (
                Turn::Fresh {
                    prompt: prompt.to_string(),
                    append_user: true,
                },
                0,
            ),
            (None, None) => return Err(EngineError::NothingToResume(handle.id.clone())),
        };

        let (sink, rx) = EventSink::channel(start_seq);
        let core = Arc::clone(&self.core);
        let run_cancel = cancel.clone();
        let request = RunRequest {
            turn,
            handle: handle.clone(),
            attributes: options.attributes,
            team_context: None,
        };
        let task = tokio::spawn(async move {
            let _lease = lease;
            let outcome = core.run_loop(request, &sink, &run_cancel).await;
            conclude(&core.name, outcome, retained, &handle, &sink)
        });
        Ok(AgentStream::new(rx, cancel, task))
    }
}

/// Check the session's pause state before a turn. Returns the decided run to resume, if
/// it belongs to `owner`.
pub(crate) fn claim_resumable(
    handle: &SessionHandle,
    owner: &str,
) -> Result<Option<ResumableRun>, EngineError> {
    if handle.ephemeral {
        return Ok(None);
    }
    let session = handle.store.get(&handle.id)?;
    if let Some(progress) = &session.team_progress {
        if progress.team != owner {
            return Err(EngineError::ForeignRun {
                session: handle.id.clone(),
                owner: progress.team.clone(),
            });
        }
    }
    if session.pending.is_some() {
        return Err(EngineError::AwaitingDecision(handle.id.clone()));
    }
    match &session.resolved {
        None => Ok(None),
        Some(run) if session.team_progress.is_none() && run.checkpoint.agent != owner => {
            Err(EngineError::ForeignRun {
                session: handle.id.clone(),
                owner: run.checkpoint.agent.clone(),
            })
        }
        Some(_) => Ok(handle.store.take_resumable(&handle.id)?),
    }
}

pub(crate) fn submit_decision(
    runtime: &Runtime,
    session: &SessionId,
    tool_name: &str,
    decision: HitlDecision,
) -> Result<HitlTask, EngineError> {
    let store = runtime.store();
    if let Some(task) = store.pending_task(session)? {
        if task.tool_name != tool_name {
            return Err(EngineError::DecisionMismatch {
                expected: task.tool_name,
                got: tool_name.to_string(),
            });
        }
    }
    let task = store.resolve_pending(session, decision)?;
    info!(session_id = %session, tool = %task.tool_name, "decision recorded");
    Ok(task)
}

/// Persist a paused run and emit the terminal event of an agent call. A failed resume
/// puts the decided run back so the session can be resumed again.
fn conclude(
    agent: &str,
    outcome: LoopOutcome,
    retained: Option<ResumableRun>,
    handle: &SessionHandle,
    sink: &EventSink,
) -> Result<Response, EngineError> {
    let result = match outcome {
        LoopOutcome::Done { content, trace } => Ok(Response {
            session_id: handle.public_id(),
            agent: agent.to_string(),
            content,
            trace,
            pending_task: None,
        }),
        LoopOutcome::Paused {
            task,
            mut checkpoint,
            content,
            trace,
        } => {
            // The terminal event below takes the next sequence number.
            checkpoint.next_seq = sink.next_seq() + 1;
            if handle.ephemeral {
                warn!(agent, tool = %task.tool_name, "ephemeral session paused, run cannot be resumed");
            }
            handle
                .store
                .suspend(
                    &handle.id,
                    SuspendedRun {
                        task: task.clone(),
                        checkpoint,
                    },
                )
                .map(|()| Response {
                    session_id: handle.public_id(),
                    agent: agent.to_string(),
                    content,
                    trace,
                    pending_task: Some(task),
                })
                .map_err(EngineError::from)
        }
        LoopOutcome::Failed(e) => {
            if let Some(run) = retained {
                restore_resumable(handle, run);
            }
            Err(e)
        }
    };
    emit_terminal(&result, handle, sink);
    result
}

/// Return a decided run to the store after its resume failed. The next resume replays
/// the decided call.
pub(crate) fn restore_resumable(handle: &SessionHandle, run: ResumableRun) {
    let tool = run.task.tool_name.clone();
    match handle.store.restore_resumable(&handle.id, run) {
        Ok(()) => info!(session_id = %handle.id, tool = %tool, "decided run restored after failure"),
        Err(e) => warn!(session_id = %handle.id, tool = %tool, error = %e, "decided run not restored"),
    }
}

pub(crate) fn emit_terminal(
    result: &Result<Response, EngineError>,
    handle: &SessionHandle,
    sink: &EventSink,
) {
    let event = match result {
        Ok(response) => AgentEvent::Finished {
            session_id: handle.id.clone(),
            response: response.clone(),
        },
        Err(e) => AgentEvent::Failed {
            session_id: handle.id.clone(),
            error_kind: e.category().to_string(),
            message: e.to_string(),
        },
    };
    let _ = sink.emit(event);
}

/// Builder for [`Agent`]. Defaults come from the runtime's settings.
pub struct AgentBuilder {
    runtime: Runtime,
    name: String,
    instruction: String,
    provider: Option<Arc<dyn LlmProvider>>,
    tools: ToolRegistry,
    skills: SkillRegistry,
    filters: Vec<ToolFilter>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    max_steps: u32,
    planning: bool,
    plan_strategy: PlanStrategy,
    output_key: Option<String>,
    output_schema: Option<Value>,
    tool_timeout: Duration,
    model_timeout: Duration,
    max_observation_bytes: usize,
    stream_options: StreamOptions,
    errors: Vec<EngineError>,
}

impl AgentBuilder {
    pub(crate) fn new(runtime: Runtime, name: impl Into<String>) -> Self {
        let agent = runtime.settings().agent.clone();
        Self {
            name: name.into(),
            instruction: String::new(),
            provider: None,
            tools: ToolRegistry::new(),
            skills: SkillRegistry::new(),
            filters: Vec::new(),
            interceptors: Vec::new(),
            max_steps: agent.max_steps,
            planning: agent.planning,
            plan_strategy: PlanStrategy::default(),
            output_key: None,
            output_schema: None,
            tool_timeout: agent.tool_timeout(),
            model_timeout: agent.model_timeout(),
            max_observation_bytes: agent.max_observation_bytes,
            stream_options: StreamOptions::default(),
            errors: Vec::new(),
            runtime,
        }
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        if let Err(e) = self.tools.register(tool, ToolSource::Local) {
            self.errors.push(e);
        }
        self
    }

    pub fn tool_provider(mut self, provider: &dyn ToolProvider, source: ToolSource) -> Self {
        if let Err(e) = self.tools.register_provider(provider, source) {
            self.errors.push(e);
        }
        self
    }

    pub fn skill(mut self, skill: Arc<dyn Skill>) -> Self {
        if let Err(e) = self.skills.register(skill) {
            self.errors.push(e);
        }
        self
    }

    pub fn filter(mut self, filter: ToolFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add an interceptor. Interceptors run in the order added.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn hitl(self, gate: HitlGate) -> Self {
        self.interceptor(Arc::new(gate))
    }

    pub fn max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn planning(mut self, enabled: bool) -> Self {
        self.planning = enabled;
        self
    }

    pub fn plan_strategy(mut self, strategy: PlanStrategy) -> Self {
        self.plan_strategy = strategy;
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn max_observation_bytes(mut self, bytes: usize) -> Self {
        self.max_observation_bytes = bytes;
        self
    }

    pub fn stream_options(mut self, options: StreamOptions) -> Self {
        self.stream_options = options;
        self
    }

    pub fn build(mut self) -> Result<Agent, EngineError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("agent name must not be empty".into()));
        }
        let provider = self.provider.ok_or_else(|| {
            EngineError::Config(format!("agent {} has no model provider", self.name))
        })?;
        if self.max_steps == 0 {
            return Err(EngineError::Config(format!(
                "agent {}: max_steps must be at least 1",
                self.name
            )));
        }
        if self.output_schema.is_some() && self.output_key.is_none() {
            return Err(EngineError::Config(format!(
                "agent {}: output schema without an output key",
                self.name
            )));
        }
        if let Some(schema) = &self.output_schema {
            if !schema.is_object() {
                return Err(EngineError::Config(format!(
                    "agent {}: output schema must be a JSON object",
                    self.name
                )));
            }
        }

        let mut pipeline = ToolPipeline::new(self.tool_timeout, self.max_observation_bytes);
        for interceptor in self.interceptors {
            pipeline.push(interceptor);
        }
        Ok(Agent {
            core: Arc::new(AgentCore {
                name: self.name,
                instruction: self.instruction,
                provider,
                tools: self.tools,
                skills: self.skills,
                filters: self.filters,
                pipeline,
                max_steps: self.max_steps,
                planning: self.planning,
                plan_strategy: self.plan_strategy,
                output_key: self.output_key,
                output_schema: self.output_schema,
                model_timeout: self.model_timeout,
                stream_options: self.stream_options,
            }),
            runtime: self.runtime,
        })
    }
}
