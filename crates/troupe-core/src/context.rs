use serde::{Deserialize, Serialize};

use crate::messages::Message;
use crate::tools::ToolDefinition;

/// The complete conversation handed to a model invocation.
#[derive(Clone, Debug, Default)]
pub struct LlmContext {
    pub messages: Vec<Message>,
    pub system_blocks: Vec<SystemBlock>,
    pub tools: Vec<ToolDefinition>,
}

impl LlmContext {
    pub fn empty() -> Self {
        Self::default()
    }

    /// All system blocks joined into one instruction string.
    pub fn system_prompt(&self) -> String {
        self.system_blocks
            .iter()
            .map(|b| b.content.as_str())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn has_block(&self, label: &SystemBlockLabel) -> bool {
        self.system_blocks.iter().any(|b| &b.label == label)
    }

    /// Text of the last user message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::User(u) => Some(u.content.as_str()),
            _ => None,
        })
    }
}

/// One section of the effective system instruction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemBlock {
    pub content: String,
    pub label: SystemBlockLabel,
}

impl SystemBlock {
    pub fn new(label: SystemBlockLabel, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            label,
        }
    }
}

/// Labels for tracking what's in the context.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemBlockLabel {
    AgentInstruction,
    SkillContext,
    Plan,
    TeamContext,
    Custom(String),
}
