//! Interceptor chain around every tool call.
//!
//! Order: interceptors (in registration order) → argument validation → execute with
//! timeout and panic capture → truncate. Every failure becomes an `[error]` observation.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use troupe_core::hitl::{HitlDecision, HitlTask};
use troupe_core::ids::{SessionId, TaskId, ToolCallId};
use troupe_core::messages::ToolCallBlock;
use troupe_core::schema;
use troupe_core::tools::{ToolContext, ToolDefinition, ToolResult};

use crate::context::CallContext;
use crate::registry::ToolRegistry;
use crate::truncate::truncate_output;

/// What an interceptor decided for a call.
#[derive(Clone, Debug, PartialEq)]
pub enum Interception {
    Continue,
    /// Replace the arguments seen by later interceptors and the tool.
    Rewrite(Value),
    /// Skip the tool and use this result.
    ShortCircuit(ToolResult),
    /// Hold the call for a human decision.
    Suspend { justification: String },
}

/// Read-only view of the call an interceptor is deciding on.
pub struct InterceptContext<'a> {
    pub definition: &'a ToolDefinition,
    pub call: &'a CallContext,
    pub session_id: &'a SessionId,
    pub agent: &'a str,
    /// Set when a human already approved this call.
    pub approved: bool,
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn intercept(&self, call: &ToolCallBlock, ctx: &InterceptContext<'_>) -> Interception;
}

type GatePredicate = dyn Fn(&ToolCallBlock, &ToolDefinition) -> bool + Send + Sync;

enum GateMatcher {
    Names(HashSet<String>),
    Predicate(Arc<GatePredicate>),
}

/// Suspends matching calls until a human approves or rejects them.
pub struct HitlGate {
    matcher: GateMatcher,
    justification: Option<String>,
}

impl HitlGate {
    pub fn for_tools<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matcher: GateMatcher::Names(names.into_iter().map(Into::into).collect()),
            justification: None,
        }
    }

    pub fn when(
        predicate: impl Fn(&ToolCallBlock, &ToolDefinition) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            matcher: GateMatcher::Predicate(Arc::new(predicate)),
            justification: None,
        }
    }

    /// Gate every tool whose metadata marks it `destructive`.
    pub fn destructive() -> Self {
        Self::when(|_, def| def.flag("destructive"))
    }

    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = Some(justification.into());
        self
    }

    pub fn matches(&self, call: &ToolCallBlock, definition: &ToolDefinition) -> bool {
        match &self.matcher {
            GateMatcher::Names(names) => names.contains(&call.name),
            GateMatcher::Predicate(predicate) => predicate(call, definition),
        }
    }
}

impl fmt::Debug for HitlGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let matcher = match &self.matcher {
            GateMatcher::Names(names) => format!("Names({names:?})"),
            GateMatcher::Predicate(_) => "Predicate(..)".to_string(),
        };
        f.debug_struct("HitlGate")
            .field("matcher", &matcher)
            .field("justification", &self.justification)
            .finish()
    }
}

#[async_trait]
impl Interceptor for HitlGate {
    fn name(&self) -> &str {
        "hitl_gate"
    }

    async fn intercept(&self, call: &ToolCallBlock, ctx: &InterceptContext<'_>) -> Interception {
        if ctx.approved || !self.matches(call, ctx.definition) {
            return Interception::Continue;
        }
        let justification = self.justification.clone().unwrap_or_else(|| {
            ctx.definition
                .meta_str("approval_reason")
                .map_or_else(|| format!("{} requires approval", call.name), str::to_string)
        });
        Interception::Suspend { justification }
    }
}

/// One completed tool call, successful or not.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    /// Arguments the tool actually ran with.
    pub arguments: Value,
    pub content: String,
    pub is_error: bool,
    pub duration: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CallOutcome {
    Completed(Observation),
    Suspended(HitlTask),
}

/// The ordered interceptor chain plus execution limits.
#[derive(Clone)]
pub struct ToolPipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
    tool_timeout: Duration,
    max_observation_bytes: usize,
}

impl ToolPipeline {
    pub fn new(tool_timeout: Duration, max_observation_bytes: usize) -> Self {
        Self {
            interceptors: Vec::new(),
            tool_timeout,
            max_observation_bytes,
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run one model-requested call through the chain.
    #[instrument(skip_all, fields(tool = %call.name, tool_call_id = %call.id))]
    pub async fn run(
        &self,
        call: &ToolCallBlock,
        tools: &ToolRegistry,
        tool_ctx: &ToolContext,
        call_ctx: &CallContext,
    ) -> CallOutcome {
        self.dispatch(call, tools, tool_ctx, call_ctx, false).await
    }

    /// Continue a suspended call with the human's decision. Never suspends again.
    #[instrument(skip_all, fields(tool = %task.tool_name, outcome = ?decision.outcome))]
    pub async fn resume(
        &self,
        task: &HitlTask,
        decision: &HitlDecision,
        tools: &ToolRegistry,
        tool_ctx: &ToolContext,
        call_ctx: &CallContext,
    ) -> Observation {
        if !decision.is_approved() {
            return Observation {
                tool_call_id: task.tool_call_id.clone(),
                tool_name: task.tool_name.clone(),
                arguments: task.arguments.clone(),
                content: decision.rejection_observation(&task.tool_name),
                is_error: false,
                duration: Duration::ZERO,
            };
        }
        let call = ToolCallBlock {
            id: task.tool_call_id.clone(),
            name: task.tool_name.clone(),
            arguments: decision.effective_arguments(&task.arguments),
        };
        match self.dispatch(&call, tools, tool_ctx, call_ctx, true).await {
            CallOutcome::Completed(observation) => observation,
            CallOutcome::Suspended(_) => {
                warn!(tool = %task.tool_name, "interceptor suspended an approved call");
                self.failure(&call, "call was suspended again after approval", Duration::ZERO)
            }
        }
    }

    async fn dispatch(
        &self,
        call: &ToolCallBlock,
        tools: &ToolRegistry,
        tool_ctx: &ToolContext,
        call_ctx: &CallContext,
        approved: bool,
    ) -> CallOutcome {
        let start = Instant::now();
        let (Some(tool), Some(definition)) = (tools.get(&call.name), tools.definition(&call.name))
        else {
            warn!(tool = %call.name, "unknown tool requested");
            return CallOutcome::Completed(self.failure(
                call,
                &format!("Unknown tool: {}", call.name),
                start.elapsed(),
            ));
        };

        let mut current = call.clone();
        for interceptor in &self.interceptors {
            let ictx = InterceptContext {
                definition,
                call: call_ctx,
                session_id: &tool_ctx.session_id,
                agent: &tool_ctx.agent,
                approved,
            };
            match interceptor.intercept(&current, &ictx).await {
                Interception::Continue => {}
                Interception::Rewrite(arguments) => {
                    debug!(interceptor = interceptor.name(), "arguments rewritten");
                    current.arguments = arguments;
                }
                Interception::ShortCircuit(result) => {
                    debug!(interceptor = interceptor.name(), "call short-circuited");
                    return CallOutcome::Completed(self.observe(&current, result, start.elapsed()));
                }
                Interception::Suspend { justification } => {
                    debug!(interceptor = interceptor.name(), "call suspended for approval");
                    return CallOutcome::Suspended(HitlTask {
                        id: TaskId::new(),
                        session_id: tool_ctx.session_id.clone(),
                        agent: tool_ctx.agent.clone(),
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        justification,
                        created_at: Utc::now(),
                    });
                }
            }
        }

        if let Err(reason) = schema::validate(&definition.parameters_schema, &current.arguments) {
            return CallOutcome::Completed(self.failure(
                &current,
                &format!("Invalid arguments: {reason}"),
                start.elapsed(),
            ));
        }

        let result = tokio::time::timeout(
            self.tool_timeout,
            std::panic::AssertUnwindSafe(tool.execute(current.arguments.clone(), tool_ctx))
                .catch_unwind(),
        )
        .await;
        let elapsed = start.elapsed();

        let observation = match result {
            Ok(Ok(Ok(result))) => self.observe(&current, result, elapsed),
            Ok(Ok(Err(e))) => self.failure(&current, &e.to_string(), elapsed),
            Ok(Err(panic)) => {
                error!(
                    tool = %current.name,
                    panic = %panic_message(&panic),
                    "tool panicked during execution"
                );
                self.failure(&current, "Internal error: tool crashed", elapsed)
            }
            Err(_) => {
                warn!(
                    tool = %current.name,
                    timeout_ms = u64::try_from(self.tool_timeout.as_millis()).unwrap_or(u64::MAX),
                    "tool timed out"
                );
                self.failure(
                    &current,
                    &format!("Tool timed out after {}ms", self.tool_timeout.as_millis()),
                    elapsed,
                )
            }
        };
        CallOutcome::Completed(observation)
    }

    fn observe(&self, call: &ToolCallBlock, result: ToolResult, elapsed: Duration) -> Observation {
        let content = if result.is_error && !result.content.starts_with("[error]") {
            format!("[error] {}", result.content)
        } else {
            result.content
        };
        Observation {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            content: truncate_output(&content, self.max_observation_bytes),
            is_error: result.is_error,
            duration: if result.duration.is_zero() { elapsed } else { result.duration },
        }
    }

    fn failure(&self, call: &ToolCallBlock, message: &str, elapsed: Duration) -> Observation {
        self.observe(call, ToolResult::error(message), elapsed)
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use troupe_core::tools::{Tool, ToolError, ToolMetadata};

    use crate::registry::ToolSource;

    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo the text argument"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }
        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResult::text(args["text"].as_str().unwrap_or_default()))
        }
    }

    struct Wipe;

    #[async_trait]
    impl Tool for Wipe {
        fn name(&self) -> &str {
            "wipe"
        }
        fn description(&self) -> &str {
            "delete everything"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata::from([("destructive".to_string(), json!(true))])
        }
        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::text(format!("wiped {}", args["path"].as_str().unwrap_or("?"))))
        }
    }

    struct Misbehaving(&'static str);

    #[async_trait]
    impl Tool for Misbehaving {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "fails in interesting ways"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            match self.0 {
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(ToolResult::text("late"))
                }
                "panics" => panic!("boom"),
                "fails" => Err(ToolError::ExecutionFailed("disk full".into())),
                _ => Ok(ToolResult::text("x".repeat(500))),
            }
        }
    }

    struct Upper;

    #[async_trait]
    impl Interceptor for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        async fn intercept(&self, call: &ToolCallBlock, _ctx: &InterceptContext<'_>) -> Interception {
            match call.arguments["text"].as_str() {
                Some(t) => Interception::Rewrite(json!({"text": t.to_uppercase()})),
                None => Interception::Continue,
            }
        }
    }

    struct Cached;

    #[async_trait]
    impl Interceptor for Cached {
        fn name(&self) -> &str {
            "cache"
        }
        async fn intercept(&self, _call: &ToolCallBlock, _ctx: &InterceptContext<'_>) -> Interception {
            Interception::ShortCircuit(ToolResult::text("cached"))
        }
    }

    fn tools(echo: Arc<Echo>) -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(echo, ToolSource::Local).unwrap();
        reg.register(Arc::new(Wipe), ToolSource::Local).unwrap();
        for name in ["slow", "panics", "fails", "big"] {
            reg.register(Arc::new(Misbehaving(name)), ToolSource::Local).unwrap();
        }
        reg
    }

    fn tool_ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::from_raw("s1"),
            agent: "tester".into(),
            abort_signal: CancellationToken::new(),
        }
    }

    fn completed(outcome: CallOutcome) -> Observation {
        match outcome {
            CallOutcome::Completed(o) => o,
            CallOutcome::Suspended(task) => panic!("unexpected suspension: {task:?}"),
        }
    }

    fn pipeline() -> ToolPipeline {
        ToolPipeline::new(Duration::from_millis(100), 64)
    }

    #[tokio::test]
    async fn executes_and_rewrites_in_order() {
        let echo = Arc::new(Echo::default());
        let reg = tools(Arc::clone(&echo));
        let p = pipeline().with_interceptor(Arc::new(Upper));
        let call = ToolCallBlock::new("echo", json!({"text": "hi"}));
        let obs = completed(p.run(&call, &reg, &tool_ctx(), &CallContext::new("x")).await);
        assert_eq!(obs.content, "HI");
        assert_eq!(obs.arguments, json!({"text": "HI"}));
        assert!(!obs.is_error);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_circuit_skips_tool() {
        let echo = Arc::new(Echo::default());
        let reg = tools(Arc::clone(&echo));
        let p = pipeline().with_interceptor(Arc::new(Cached));
        let call = ToolCallBlock::new("echo", json!({"text": "hi"}));
        let obs = completed(p.run(&call, &reg, &tool_ctx(), &CallContext::new("x")).await);
        assert_eq!(obs.content, "cached");
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failures_become_error_observations() {
        let reg = tools(Arc::new(Echo::default()));
        let p = pipeline();
        let ctx = CallContext::new("x");

        let unknown = ToolCallBlock::new("nope", json!({}));
        let obs = completed(p.run(&unknown, &reg, &tool_ctx(), &ctx).await);
        assert!(obs.is_error);
        assert_eq!(obs.content, "[error] Unknown tool: nope");

        let invalid = ToolCallBlock::new("echo", json!({"text": 3}));
        let obs = completed(p.run(&invalid, &reg, &tool_ctx(), &ctx).await);
        assert!(obs.is_error);
        assert!(obs.content.starts_with("[error] Invalid arguments:"));

        let fails = ToolCallBlock::new("fails", json!({}));
        let obs = completed(p.run(&fails, &reg, &tool_ctx(), &ctx).await);
        assert_eq!(obs.content, "[error] execution failed: disk full");

        let panics = ToolCallBlock::new("panics", json!({}));
        let obs = completed(p.run(&panics, &reg, &tool_ctx(), &ctx).await);
        assert!(obs.is_error);
        assert_eq!(obs.content, "[error] Internal error: tool crashed");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_error_observation() {
        let reg = tools(Arc::new(Echo::default()));
        let call = ToolCallBlock::new("slow", json!({}));
        let obs = completed(pipeline().run(&call, &reg, &tool_ctx(), &CallContext::new("x")).await);
        assert!(obs.is_error);
        assert_eq!(obs.content, "[error] Tool timed out after 100ms");
    }

    #[tokio::test]
    async fn large_output_is_truncated() {
        let reg = tools(Arc::new(Echo::default()));
        let call = ToolCallBlock::new("big", json!({}));
        let obs = completed(pipeline().run(&call, &reg, &tool_ctx(), &CallContext::new("x")).await);
        assert!(obs.content.contains("[truncated: 500 bytes -> 64 bytes]"));
    }

    #[tokio::test]
    async fn gate_suspends_with_original_arguments() {
        let reg = tools(Arc::new(Echo::default()));
        let p = pipeline()
            .with_interceptor(Arc::new(Upper))
            .with_interceptor(Arc::new(HitlGate::for_tools(["echo"])));
        let call = ToolCallBlock::new("echo", json!({"text": "hi"}));
        match p.run(&call, &reg, &tool_ctx(), &CallContext::new("x")).await {
            CallOutcome::Suspended(task) => {
                assert_eq!(task.tool_name, "echo");
                assert_eq!(task.tool_call_id, call.id);
                assert_eq!(task.arguments, json!({"text": "hi"}));
                assert_eq!(task.session_id.as_str(), "s1");
                assert_eq!(task.justification, "echo requires approval");
            }
            other => panic!("expected suspension, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn destructive_gate_matches_metadata() {
        let reg = tools(Arc::new(Echo::default()));
        let p = pipeline().with_interceptor(Arc::new(
            HitlGate::destructive().with_justification("irreversible"),
        ));
        let ctx = CallContext::new("x");
        let safe = ToolCallBlock::new("echo", json!({"text": "a"}));
        assert!(matches!(
            p.run(&safe, &reg, &tool_ctx(), &ctx).await,
            CallOutcome::Completed(_)
        ));
        let wipe = ToolCallBlock::new("wipe", json!({"path": "/"}));
        match p.run(&wipe, &reg, &tool_ctx(), &ctx).await {
            CallOutcome::Suspended(task) => assert_eq!(task.justification, "irreversible"),
            other => panic!("expected suspension, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_applies_decision() {
        let echo = Arc::new(Echo::default());
        let reg = tools(Arc::clone(&echo));
        let p = pipeline().with_interceptor(Arc::new(HitlGate::destructive()));
        let ctx = CallContext::new("x");
        let wipe = ToolCallBlock::new("wipe", json!({"path": "/tmp", "force": true}));
        let CallOutcome::Suspended(task) = p.run(&wipe, &reg, &tool_ctx(), &ctx).await else {
            panic!("expected suspension");
        };

        let rejected = p
            .resume(&task, &HitlDecision::reject("too risky"), &reg, &tool_ctx(), &ctx)
            .await;
        assert_eq!(rejected.content, "[rejected] wipe was not run: too risky");
        assert!(!rejected.is_error);

        let approved = p
            .resume(&task, &HitlDecision::approve(), &reg, &tool_ctx(), &ctx)
            .await;
        assert_eq!(approved.content, "wiped /tmp");

        let overridden = p
            .resume(
                &task,
                &HitlDecision::approve().with_overrides(json!({"path": "/tmp/cache"})),
                &reg,
                &tool_ctx(),
                &ctx,
            )
            .await;
        assert_eq!(overridden.content, "wiped /tmp/cache");
        assert_eq!(overridden.arguments, json!({"path": "/tmp/cache", "force": true}));
        assert_eq!(overridden.tool_call_id, wipe.id);
    }
}
