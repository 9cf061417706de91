use crate::errors::GatewayError;
use crate::messages::{AssistantMessage, StopReason, ToolCallBlock};

/// Events emitted while a model streams one reply. Ordering contract:
///
/// Start → (TextDelta | ThinkingDelta)* → ToolCallEnd* → Done
///
/// Error can appear at any point and ends the stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,
    TextDelta { delta: String },
    ThinkingDelta { delta: String },
    ToolCallEnd { tool_call: ToolCallBlock },
    Done { message: AssistantMessage, stop_reason: StopReason },
    Error { error: GatewayError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn is_content_delta(&self) -> bool {
        matches!(self, Self::TextDelta { .. } | Self::ThinkingDelta { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_events() {
        assert!(StreamEvent::Done {
            message: AssistantMessage::text("x"),
            stop_reason: StopReason::EndTurn,
        }
        .is_terminal());
        assert!(StreamEvent::Error {
            error: GatewayError::NetworkError("reset".into())
        }
        .is_terminal());
        assert!(!StreamEvent::Start.is_terminal());
    }

    #[test]
    fn content_deltas() {
        assert!(StreamEvent::TextDelta { delta: "a".into() }.is_content_delta());
        assert!(StreamEvent::ThinkingDelta { delta: "a".into() }.is_content_delta());
        assert!(!StreamEvent::Start.is_content_delta());
    }
}
