use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::ids::SessionId;
use crate::schema::{self, SchemaError};

/// Arbitrary key/value annotations on a tool, e.g. `destructive` or `role`.
pub type ToolMetadata = BTreeMap<String, Value>;

/// Context available to tools during execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub agent: String,
    pub abort_signal: CancellationToken,
}

/// Result returned by a tool execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    #[serde(with = "duration_ms", default)]
    pub duration: Duration,
}

impl ToolResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            duration: Duration::ZERO,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            duration: Duration::ZERO,
        }
    }
}

/// Tool descriptor shown to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "ToolMetadata::is_empty")]
    pub metadata: ToolMetadata,
}

impl ToolDefinition {
    /// Truthy metadata flag (`true`, `"true"`, or a non-zero number).
    pub fn flag(&self, key: &str) -> bool {
        match self.metadata.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            _ => false,
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Setup-time validation of the descriptor.
    pub fn validate(&self) -> Result<(), InvalidTool> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(InvalidTool::Name(self.name.clone()));
        }
        schema::check_object_schema(&self.parameters_schema).map_err(|source| {
            InvalidTool::Parameters {
                tool: self.name.clone(),
                source,
            }
        })?;
        if let Some(output) = &self.output_schema {
            if !output.is_object() {
                return Err(InvalidTool::Output {
                    tool: self.name.clone(),
                    source: SchemaError::NotAnObject,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidTool {
    #[error("invalid tool name {0:?}")]
    Name(String),
    #[error("tool {tool}: invalid parameter schema: {source}")]
    Parameters { tool: String, source: SchemaError },
    #[error("tool {tool}: invalid output schema: {source}")]
    Output { tool: String, source: SchemaError },
}

/// The tool invocation capability.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    fn output_schema(&self) -> Option<Value> {
        None
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
            output_schema: self.output_schema(),
            metadata: self.metadata(),
        }
    }
}

/// Any source of callable tools: local code, a skill, a remote tool server.
pub trait ToolProvider: Send + Sync {
    fn list_tools(&self) -> Vec<Arc<dyn Tool>>;
}

impl ToolProvider for Vec<Arc<dyn Tool>> {
    fn list_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// Serde helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
