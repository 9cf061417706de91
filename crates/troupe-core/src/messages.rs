use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ToolCallId;

/// Free-form key/value annotations attached to a message.
pub type Metadata = BTreeMap<String, Value>;

/// Metadata key holding an answer with its thinking segments removed.
pub const STRIPPED_CONTENT_KEY: &str = "stripped_content";
/// Metadata key naming the agent that produced an assistant message.
pub const AGENT_KEY: &str = "agent";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "system")]
    System(SystemMessage),
    #[serde(rename = "user")]
    User(UserMessage),
    #[serde(rename = "assistant")]
    Assistant(AssistantMessage),
    #[serde(rename = "tool_result")]
    ToolResult(ToolResultMessage),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<AssistantContent>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AssistantContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { text: String },
    #[serde(rename = "tool_call")]
    ToolCall(ToolCallBlock),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallBlock {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: Value,
}

impl ToolCallBlock {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: ToolCallId::new(),
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Message::System(SystemMessage {
            content: text.into(),
        })
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User(UserMessage {
            content: text.into(),
            metadata: Metadata::new(),
        })
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Message::Assistant(AssistantMessage::text(text))
    }

    pub fn tool_result(
        tool_call_id: ToolCallId,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Message::ToolResult(ToolResultMessage {
            tool_call_id,
            tool_name: tool_name.into(),
            content: content.into(),
            is_error,
        })
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System(_) => Role::System,
            Message::User(_) => Role::User,
            Message::Assistant(_) => Role::Assistant,
            Message::ToolResult(_) => Role::Tool,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Message::System(_))
    }

    /// Concatenated visible text of the message.
    pub fn text_content(&self) -> String {
        match self {
            Message::System(m) => m.content.clone(),
            Message::User(m) => m.content.clone(),
            Message::Assistant(m) => m.text_content(),
            Message::ToolResult(m) => m.content.clone(),
        }
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        match self {
            Message::User(m) => Some(&m.metadata),
            Message::Assistant(m) => Some(&m.metadata),
            _ => None,
        }
    }
}

impl AssistantMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![AssistantContent::Text { text: text.into() }],
            metadata: Metadata::new(),
            stop_reason: Some(StopReason::EndTurn),
        }
    }

    pub fn tool_calls(&self) -> Vec<&ToolCallBlock> {
        self.content
            .iter()
            .filter_map(|c| match c {
                AssistantContent::ToolCall(tc) => Some(tc),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, AssistantContent::ToolCall(_)))
    }

    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        let _ = self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Remove `<think>…</think>` segments some models interleave with their answer.
/// An unterminated segment swallows the rest of the text.
pub fn strip_thinking(text: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        match rest[start + OPEN.len()..].find(CLOSE) {
            Some(end) => rest = &rest[start + OPEN.len() + end + CLOSE.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}
