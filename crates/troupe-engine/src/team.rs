//! Team orchestration: several agents sharing one session under a sequential or a
//! supervisor-directed protocol.
//!
//! A team call appends the user prompt once, then runs member turns against the shared
//! history. Member events flow into the team's stream between `member_started` and
//! `member_finished`. A member pause pauses the whole team; the awaiting member is recorded
//! in the session so a later call or resume continues with that member only.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use troupe_core::checkpoint::TeamProgress;
use troupe_core::context::{LlmContext, SystemBlock, SystemBlockLabel};
use troupe_core::errors::GatewayError;
use troupe_core::events::AgentEvent;
use troupe_core::hitl::{HitlDecision, HitlTask};
use troupe_core::ids::{RunId, SessionId};
use troupe_core::messages::{strip_thinking, AssistantMessage, Message, AGENT_KEY};
use troupe_core::provider::{LlmProvider, StreamOptions};
use troupe_core::trace::{Response, Trace, TraceStatus};
use troupe_store::{ResumableRun, Session, SuspendedRun};

use crate::agent::{
    claim_resumable, emit_terminal, restore_resumable, submit_decision, Agent, CallOptions,
};
use crate::error::EngineError;
use crate::runner::{LoopOutcome, RunRequest, Turn, CANCELLED_NOTICE};
use crate::runtime::{Runtime, SessionHandle};
use crate::stream::{AgentStream, EventSink};

const CONCLUDE_WORDS: &[&str] = &["finish", "done"];

/// How the next member is chosen.
#[derive(Clone)]
pub enum TeamMode {
    /// Every member once, in registration order.
    Sequential,
    /// A model picks the next member after each turn, or concludes.
    Supervisor(Arc<dyn LlmProvider>),
}

impl std::fmt::Debug for TeamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => f.write_str("Sequential"),
            Self::Supervisor(p) => write!(f, "Supervisor({})", p.model()),
        }
    }
}

struct TeamInner {
    name: String,
    members: Vec<Agent>,
    mode: TeamMode,
    turn_budget: u32,
    model_timeout: Duration,
}

/// A composition of agents bound to one [`Runtime`].
#[derive(Clone)]
pub struct Team {
    inner: Arc<TeamInner>,
    runtime: Runtime,
}

impl std::fmt::Debug for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Team")
            .field("name", &self.inner.name)
            .field("members", &self.member_names())
            .field("mode", &self.inner.mode)
            .field("turn_budget", &self.inner.turn_budget)
            .finish()
    }
}

enum TeamStart {
    Fresh(String),
    Resumed {
        run: ResumableRun,
        progress: TeamProgress,
        index: usize,
    },
}

enum Selection {
    Member(usize),
    Conclude,
    Cancelled,
}

impl Team {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn member_names(&self) -> Vec<&str> {
        self.inner.members.iter().map(Agent::name).collect()
    }

    pub fn turn_budget(&self) -> u32 {
        self.inner.turn_budget
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
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

    /// Stream a team turn's events.
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

    /// Like [`Team::stream`], stopped early by `cancel`.
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

    /// Start a team turn. A decided member pause on the session is resumed instead and the
    /// prompt is ignored.
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

    /// Stream the resumed team run of a decided session.
    ///
    /// # Panics
    ///
    /// Spawns the run, so it panics if called outside a Tokio runtime.
    pub fn resume_stream(&self, session: &SessionId) -> Result<AgentStream, EngineError> {
        self.start(None, Some(session), CallOptions::default())
    }

    /// Like [`Team::resume_stream`], stopped early by `cancel`.
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

        let (progress, awaiting) = if handle.ephemeral {
            (None, None)
        } else {
            let session = handle.store.get(&handle.id)?;
            let awaiting = match &session.team_progress {
                Some(progress) if progress.team == self.inner.name => {
                    self.inner.awaiting_member(&handle, &session, progress)?
                }
                _ => None,
            };
            (session.team_progress, awaiting)
        };
        let resumable = claim_resumable(&handle, &self.inner.name)?;
        let (start, start_seq) = match (resumable, progress, prompt) {
            (Some(run), Some(progress), prompt) => {
                if prompt.is_some() {
                    debug!(team = %self.inner.name, "decided member run pending, prompt ignored");
                }
                let Some(index) = awaiting else {
                    return Err(EngineError::Internal(format!(
                        "paused member {} of team {} not located",
                        progress.awaiting_member, self.inner.name
                    )));
                };
                let seq = run.checkpoint.next_seq;
                (TeamStart::Resumed { run, progress, index }, seq)
            }
            (Some(run), None, _) => {
                return Err(EngineError::Internal(format!(
                    "decided run of {} on session {} has no team progress",
                    run.checkpoint.agent, handle.id
                )))
            }
            (None, progress, Some(prompt)) => {
                if progress.is_some() {
                    warn!(team = %self.inner.name, session_id = %handle.id, "stale team progress discarded");
                    handle.store.set_team_progress(&handle.id, None)?;
                }
                (TeamStart::Fresh(prompt.to_string()), 0)
            }
            (None, _, None) => return Err(EngineError::NothingToResume(handle.id.clone())),
        };

        let (sink, rx) = EventSink::channel(start_seq);
        let inner = Arc::clone(&self.inner);
        let run_cancel = cancel.clone();
        let attributes = options.attributes;
        let mut retained = match &start {
            TeamStart::Resumed { run, .. } => Some(run.clone()),
            TeamStart::Fresh(_) => None,
        };
        let task = tokio::spawn(async move {
            let _lease = lease;
            let result = inner
                .run(start, &handle, attributes, &sink, &run_cancel, &mut retained)
                .await;
            if result.is_err() {
                // An unfinished resume keeps its progress so the decided member can run again.
                match retained {
                    Some(run) => restore_resumable(&handle, run),
                    None => {
                        if let Err(e) = handle.store.set_team_progress(&handle.id, None) {
                            warn!(team = %inner.name, error = %e, "failed to clear team progress");
                        }
                    }
                }
            }
            emit_terminal(&result, &handle, &sink);
            result
        });
        Ok(AgentStream::new(rx, cancel, task))
    }
}

impl TeamInner {
    /// Roster position of the member a paused team waits on. Fails if that member is no
    /// longer on the roster or the paused run belongs to someone else.
    fn awaiting_member(
        &self,
        handle: &SessionHandle,
        session: &Session,
        progress: &TeamProgress,
    ) -> Result<Option<usize>, EngineError> {
        let paused_agent = match (&session.pending, &session.resolved) {
            (Some(run), _) => &run.checkpoint.agent,
            (None, Some(run)) => &run.checkpoint.agent,
            (None, None) => return Ok(None),
        };
        let index = self
            .members
            .iter()
            .position(|m| m.name() == progress.awaiting_member);
        match index {
            Some(index) if *paused_agent == progress.awaiting_member => Ok(Some(index)),
            _ => {
                warn!(
                    team = %self.name,
                    member = %progress.awaiting_member,
                    "paused member is not on the roster"
                );
                Err(EngineError::ForeignRun {
                    session: handle.id.clone(),
                    owner: progress.awaiting_member.clone(),
                })
            }
        }
    }

    fn team_context(&self, member: &str) -> String {
        let roster: Vec<&str> = self.members.iter().map(Agent::name).collect();
        format!(
            "You are {member} in team {}. Members: {}.",
            self.name,
            roster.join(", ")
        )
    }

    #[instrument(skip_all, fields(team = %self.name, session_id = %handle.id))]
    async fn run(
        &self,
        start: TeamStart,
        handle: &SessionHandle,
        attributes: BTreeMap<String, Value>,
        sink: &EventSink,
        cancel: &CancellationToken,
        retained: &mut Option<ResumableRun>,
    ) -> Result<Response, EngineError> {
        let (prompt, mut aggregate, mut last_content, mut resumed) = match start {
            TeamStart::Fresh(prompt) => {
                handle
                    .store
                    .append(&handle.id, Message::user_text(prompt.as_str()))?;
                (prompt, Trace::default(), String::new(), None)
            }
            TeamStart::Resumed {
                run,
                progress,
                index,
            } => {
                info!(member = %progress.awaiting_member, "resuming paused member");
                (
                    run.checkpoint.prompt.clone(),
                    progress.trace,
                    progress.last_content,
                    Some((index, run)),
                )
            }
        };
        aggregate.status = TraceStatus::Running;
        let _ = sink.emit(AgentEvent::RunStarted {
            session_id: handle.id.clone(),
            agent: self.name.clone(),
            run_id: RunId::new(),
            resumed: resumed.is_some(),
        });

        let mut next_index = resumed.as_ref().map_or(0, |(i, _)| i + 1);
        let mut status = TraceStatus::Completed;
        loop {
            let (index, turn) = match resumed.take() {
                Some((index, run)) => (index, Turn::Resumed(run)),
                None => {
                    if cancel.is_cancelled() {
                        status = self.cancel_notice(handle)?;
                        last_content = CANCELLED_NOTICE.to_string();
                        break;
                    }
                    let index = match &self.mode {
                        TeamMode::Sequential => {
                            if next_index >= self.members.len() {
                                break;
                            }
                            if aggregate.turn_count >= self.turn_budget {
                                status = TraceStatus::Truncated;
                                break;
                            }
                            next_index
                        }
                        TeamMode::Supervisor(provider) => {
                            if aggregate.turn_count >= self.turn_budget {
                                status = TraceStatus::Truncated;
                                break;
                            }
                            match self.select(provider.as_ref(), handle, sink, cancel).await? {
                                Selection::Member(index) => index,
                                Selection::Conclude => break,
                                Selection::Cancelled => {
                                    status = self.cancel_notice(handle)?;
                                    last_content = CANCELLED_NOTICE.to_string();
                                    break;
                                }
                            }
                        }
                    };
                    (
                        index,
                        Turn::Fresh {
                            prompt: prompt.clone(),
                            append_user: false,
                        },
                    )
                }
            };

            let member = &self.members[index];
            let _ = sink.emit(AgentEvent::MemberStarted {
                session_id: handle.id.clone(),
                team: self.name.clone(),
                member: member.name().to_string(),
            });
            let request = RunRequest {
                turn,
                handle: handle.clone(),
                attributes: attributes.clone(),
                team_context: Some(self.team_context(member.name())),
            };
            let outcome = member.core().run_loop(request, sink, cancel).await;
            if !matches!(outcome, LoopOutcome::Failed(_)) {
                *retained = None;
            }
            match outcome {
                LoopOutcome::Done { content, trace } => {
                    let member_status = trace.status;
                    let _ = sink.emit(AgentEvent::MemberFinished {
                        session_id: handle.id.clone(),
                        team: self.name.clone(),
                        member: member.name().to_string(),
                        status: member_status,
                    });
                    aggregate.absorb(trace);
                    last_content = content;
                    next_index = index + 1;
                    if member_status == TraceStatus::Cancelled {
                        status = TraceStatus::Cancelled;
                        break;
                    }
                }
                LoopOutcome::Paused {
                    task,
                    mut checkpoint,
                    content,
                    trace,
                } => {
                    let _ = sink.emit(AgentEvent::MemberFinished {
                        session_id: handle.id.clone(),
                        team: self.name.clone(),
                        member: member.name().to_string(),
                        status: TraceStatus::Pending,
                    });
                    // The terminal event takes the next sequence number.
                    checkpoint.next_seq = sink.next_seq() + 1;
                    handle.store.set_team_progress(
                        &handle.id,
                        Some(TeamProgress {
                            team: self.name.clone(),
                            awaiting_index: index,
                            awaiting_member: member.name().to_string(),
                            trace: aggregate.clone(),
                            last_content,
                        }),
                    )?;
                    handle.store.suspend(
                        &handle.id,
                        SuspendedRun {
                            task: task.clone(),
                            checkpoint,
                        },
                    )?;
                    if handle.ephemeral {
                        warn!(team = %self.name, "ephemeral session paused, run cannot be resumed");
                    }
                    info!(member = %member.name(), tool = %task.tool_name, "team paused on member");

                    let mut view = aggregate;
                    view.steps.extend(trace.steps);
                    if view.plan.is_empty() {
                        view.plan = trace.plan;
                    }
                    view.status = TraceStatus::Pending;
                    return Ok(Response {
                        session_id: handle.public_id(),
                        agent: self.name.clone(),
                        content,
                        trace: view,
                        pending_task: Some(task),
                    });
                }
                LoopOutcome::Failed(e) => {
                    warn!(member = %member.name(), error = %e, "member failed, team run aborted");
                    return Err(e);
                }
            }
        }

        let content = if status == TraceStatus::Truncated {
            warn!(turn_budget = self.turn_budget, "team turn budget exhausted");
            let marker = format!("[truncated: team turn budget of {} reached]", self.turn_budget);
            if last_content.is_empty() {
                marker
            } else {
                format!("{last_content}\n\n{marker}")
            }
        } else {
            last_content
        };
        aggregate.status = status;
        handle.store.set_team_progress(&handle.id, None)?;
        handle.store.set_last_trace(&handle.id, aggregate.clone())?;
        info!(members_run = aggregate.turn_count, status = ?status, "team run finished");
        Ok(Response {
            session_id: handle.public_id(),
            agent: self.name.clone(),
            content,
            trace: aggregate,
            pending_task: None,
        })
    }

    fn cancel_notice(&self, handle: &SessionHandle) -> Result<TraceStatus, EngineError> {
        info!(team = %self.name, "team run cancelled");
        let notice = AssistantMessage::text(CANCELLED_NOTICE)
            .with_metadata(AGENT_KEY, self.name.as_str())
            .with_metadata("cancelled", true);
        handle.store.append(&handle.id, Message::Assistant(notice))?;
        Ok(TraceStatus::Cancelled)
    }

    fn supervisor_context(&self, handle: &SessionHandle) -> Result<LlmContext, EngineError> {
        let roster: Vec<String> = self
            .members
            .iter()
            .map(|m| {
                let about = m.core().instruction.lines().next().unwrap_or("").trim();
                if about.is_empty() {
                    format!("- {}", m.name())
                } else {
                    format!("- {}: {about}", m.name())
                }
            })
            .collect();
        let instruction = format!(
            "You coordinate team {}. Members:\n{}\n\nAfter each turn, reply with the name of \
             the member who should act next, or FINISH when the request is fully answered. \
             Put the name on the first line.",
            self.name,
            roster.join("\n")
        );
        Ok(LlmContext {
            messages: handle.store.history(&handle.id)?,
            system_blocks: vec![SystemBlock::new(
                SystemBlockLabel::Custom("supervisor".into()),
                instruction,
            )],
            tools: Vec::new(),
        })
    }

    async fn select(
        &self,
        provider: &dyn LlmProvider,
        handle: &SessionHandle,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Selection, EngineError> {
        let context = self.supervisor_context(handle)?;
        let options = StreamOptions::default();
        let reply = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(Selection::Cancelled),
            reply = tokio::time::timeout(self.model_timeout, provider.invoke(&context, &options)) => reply,
        };
        let reply = match reply {
            Ok(reply) => reply?,
            Err(_) => return Err(GatewayError::Timeout(self.model_timeout).into()),
        };
        let rationale = strip_thinking(&reply.message().text_content());
        let choice = parse_selection(&rationale, &self.members);

        let member = match choice {
            Some(Some(index)) => Some(self.members[index].name().to_string()),
            Some(None) => None,
            None => {
                warn!(team = %self.name, reply = %rationale, "supervisor named no known member, concluding");
                None
            }
        };
        debug!(team = %self.name, selected = ?member, "supervisor selection");
        let _ = sink.emit(AgentEvent::MemberSelected {
            session_id: handle.id.clone(),
            team: self.name.clone(),
            member,
            rationale,
        });
        Ok(match choice {
            Some(Some(index)) => Selection::Member(index),
            _ => Selection::Conclude,
        })
    }
}

/// `Some(Some(i))` for a member, `Some(None)` for an explicit conclusion, `None` when the
/// reply names nothing recognisable.
fn parse_selection(reply: &str, members: &[Agent]) -> Option<Option<usize>> {
    let first = reply.lines().map(str::trim).find(|l| !l.is_empty())?;
    let token = first
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '_' && c != '-');
    if CONCLUDE_WORDS.iter().any(|w| token.eq_ignore_ascii_case(w)) {
        return Some(None);
    }
    if let Some(index) = members
        .iter()
        .position(|m| m.name().eq_ignore_ascii_case(token))
    {
        return Some(Some(index));
    }
    // Fall back to a member named anywhere on the first line.
    let lower = first.to_lowercase();
    members
        .iter()
        .position(|m| lower.contains(&m.name().to_lowercase()))
        .map(Some)
}

/// Builder for [`Team`].
pub struct TeamBuilder {
    runtime: Runtime,
    name: String,
    members: Vec<Agent>,
    mode: TeamMode,
    turn_budget: u32,
    model_timeout: Duration,
}

impl TeamBuilder {
    pub(crate) fn new(runtime: Runtime, name: impl Into<String>) -> Self {
        let settings = runtime.settings();
        let turn_budget = settings.team.turn_budget;
        let model_timeout = settings.agent.model_timeout();
        Self {
            runtime,
            name: name.into(),
            members: Vec::new(),
            mode: TeamMode::Sequential,
            turn_budget,
            model_timeout,
        }
    }

    pub fn member(mut self, agent: Agent) -> Self {
        self.members.push(agent);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.mode = TeamMode::Sequential;
        self
    }

    pub fn supervisor(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.mode = TeamMode::Supervisor(provider);
        self
    }

    pub fn turn_budget(mut self, budget: u32) -> Self {
        self.turn_budget = budget;
        self
    }

    /// Timeout for each supervisor invocation.
    pub fn model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Team, EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("team name must not be empty".into()));
        }
        if self.members.is_empty() {
            return Err(EngineError::Config(format!("team {} has no members", self.name)));
        }
        if self.turn_budget == 0 {
            return Err(EngineError::Config(format!(
                "team {}: turn budget must be at least 1",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for member in &self.members {
            if !seen.insert(member.name()) {
                return Err(EngineError::Config(format!(
                    "team {}: duplicate member {}",
                    self.name,
                    member.name()
                )));
            }
            if member.name() == self.name {
                return Err(EngineError::Config(format!(
                    "team {}: member shares the team's name",
                    self.name
                )));
            }
            if !member.runtime().same_as(&self.runtime) {
                return Err(EngineError::Config(format!(
                    "team {}: member {} belongs to another runtime",
                    self.name,
                    member.name()
                )));
            }
        }
        Ok(Team {
            inner: Arc::new(TeamInner {
                name: self.name,
                members: self.members,
                mode: self.mode,
                turn_budget: self.turn_budget,
                model_timeout: self.model_timeout,
            }),
            runtime: self.runtime,
        })
    }
}
