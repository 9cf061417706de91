//! Shared test utilities: recording tools and runtime helpers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use troupe_core::tools::{Tool, ToolContext, ToolError, ToolMetadata, ToolResult};
use troupe_store::InMemorySessionStore;

use crate::runtime::Runtime;
use crate::settings::EngineSettings;

/// A tool that records every argument set it ran with.
pub struct RecordingTool {
    name: String,
    metadata: ToolMetadata,
    reply: String,
    calls: Mutex<Vec<Value>>,
}

impl RecordingTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            metadata: ToolMetadata::new(),
            reply: format!("{name} ok"),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn destructive(name: &str) -> Self {
        Self::new(name).with_meta("destructive", json!(true))
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        let _ = self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn replying(mut self, reply: &str) -> Self {
        self.reply = reply.to_string();
        self
    }

    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "records its calls"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn metadata(&self) -> ToolMetadata {
        self.metadata.clone()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        self.calls.lock().push(args);
        Ok(ToolResult::text(self.reply.as_str()))
    }
}

/// A tool that panics or hangs.
pub struct FaultyTool {
    name: &'static str,
}

impl FaultyTool {
    pub fn panicking() -> Self {
        Self { name: "crash" }
    }

    pub fn hanging() -> Self {
        Self { name: "hang" }
    }
}

#[async_trait]
impl Tool for FaultyTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "misbehaves"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        if self.name == "crash" {
            panic!("tool exploded");
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(ToolResult::text("never"))
    }
}

/// Runtime over an in-memory store the test can inspect.
pub fn runtime_with(settings: EngineSettings) -> (Runtime, Arc<InMemorySessionStore>) {
    troupe_telemetry::init_test_telemetry();
    let store = Arc::new(InMemorySessionStore::with_default_max_history(
        settings.session.max_history,
    ));
    let runtime = Runtime::new(store.clone(), settings).unwrap();
    (runtime, store)
}

pub fn runtime() -> (Runtime, Arc<InMemorySessionStore>) {
    runtime_with(EngineSettings::default())
}
