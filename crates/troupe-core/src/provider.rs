use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::context::LlmContext;
use crate::errors::GatewayError;
use crate::messages::{AssistantMessage, ToolCallBlock};
use crate::stream::StreamEvent;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Options controlling model generation behavior.
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub stop_sequences: Vec<String>,
}

/// Outcome of one non-streaming model invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelReply {
    FinalAnswer(AssistantMessage),
    ToolCalls {
        message: AssistantMessage,
        calls: Vec<ToolCallBlock>,
    },
}

impl ModelReply {
    pub fn from_message(message: AssistantMessage) -> Self {
        if message.has_tool_calls() {
            let calls = message.tool_calls().into_iter().cloned().collect();
            Self::ToolCalls { message, calls }
        } else {
            Self::FinalAnswer(message)
        }
    }

    pub fn message(&self) -> &AssistantMessage {
        match self {
            Self::FinalAnswer(message) => message,
            Self::ToolCalls { message, .. } => message,
        }
    }
}

/// The model invocation capability.
///
/// Implementors only provide `stream`; `invoke` drains it to the final message.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError>;

    async fn invoke(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<ModelReply, GatewayError> {
        let mut stream = self.stream(context, options).await?;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Done { message, .. } => return Ok(ModelReply::from_message(message)),
                StreamEvent::Error { error } => return Err(error),
                _ => {}
            }
        }
        Err(GatewayError::StreamInterrupted(
            "stream ended without a final message".into(),
        ))
    }
}
