use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;

use troupe_core::context::LlmContext;
use troupe_core::errors::GatewayError;
use troupe_core::messages::{AssistantContent, AssistantMessage, Metadata, StopReason, ToolCallBlock};
use troupe_core::provider::{EventStream, LlmProvider, StreamOptions};
use troupe_core::stream::StreamEvent;

/// Pre-programmed responses for deterministic testing without a model.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of StreamEvents.
    Stream(Vec<StreamEvent>),
    /// Return an error from the stream() call itself.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A final answer streamed as a single delta.
    pub fn stream_text(text: &str) -> Self {
        Self::stream_chunks(&[text])
    }

    /// A final answer streamed as several deltas.
    pub fn stream_chunks(chunks: &[&str]) -> Self {
        let mut events = vec![StreamEvent::Start];
        events.extend(chunks.iter().map(|c| StreamEvent::TextDelta {
            delta: (*c).to_string(),
        }));
        events.push(StreamEvent::Done {
            message: AssistantMessage::text(chunks.concat()),
            stop_reason: StopReason::EndTurn,
        });
        Self::Stream(events)
    }

    /// A reply requesting the given tool calls, optionally preceded by reasoning text.
    pub fn tool_calls(text: &str, calls: Vec<ToolCallBlock>) -> Self {
        let mut events = vec![StreamEvent::Start];
        let mut content = Vec::new();
        if !text.is_empty() {
            events.push(StreamEvent::TextDelta {
                delta: text.to_string(),
            });
            content.push(AssistantContent::Text {
                text: text.to_string(),
            });
        }
        for call in &calls {
            events.push(StreamEvent::ToolCallEnd {
                tool_call: call.clone(),
            });
        }
        content.extend(calls.into_iter().map(AssistantContent::ToolCall));
        events.push(StreamEvent::Done {
            message: AssistantMessage {
                content,
                metadata: Metadata::new(),
                stop_reason: Some(StopReason::ToolUse),
            },
            stop_reason: StopReason::ToolUse,
        });
        Self::Stream(events)
    }

    /// Shorthand for a single tool call with no reasoning text.
    pub fn tool_call(name: &str, arguments: Value) -> Self {
        Self::tool_calls("", vec![ToolCallBlock::new(name, arguments)])
    }

    /// A stream that ends with an error event.
    pub fn stream_error(error: GatewayError) -> Self {
        Self::Stream(vec![StreamEvent::Start, StreamEvent::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
///
/// Every context it receives is recorded so tests can assert on what the model saw.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    fallback: Option<MockResponse>,
    contexts: Mutex<Vec<LlmContext>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback: None,
            contexts: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Answer every call with the same response.
    pub fn repeating(response: MockResponse) -> Self {
        Self {
            fallback: Some(response),
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Contexts received so far, oldest first.
    pub fn contexts(&self) -> Vec<LlmContext> {
        self.contexts.lock().clone()
    }

    pub fn last_context(&self) -> Option<LlmContext> {
        self.contexts.lock().last().cloned()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        context: &LlmContext,
        _options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.contexts.lock().push(context.clone());

        let next = self.responses.lock().pop_front();
        let response = match next.or_else(|| self.fallback.clone()) {
            Some(r) => r,
            None => {
                return Err(GatewayError::InvalidRequest(format!(
                    "MockProvider: no response configured for call {idx}"
                )))
            }
        };

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
async fn resolve_response(response: MockResponse) -> Result<EventStream, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;
    use troupe_core::messages::Message;
    use troupe_core::provider::ModelReply;

    async fn collect(mock: &MockProvider, context: &LlmContext) -> Vec<StreamEvent> {
        let mut stream = mock
            .stream(context, &StreamOptions::default())
            .await
            .unwrap();
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn text_response() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("hello world")]);
        let events = collect(&mock, &LlmContext::empty()).await;

        assert_eq!(events.len(), 3); // Start, TextDelta, Done
        assert!(matches!(events[0], StreamEvent::Start));
        if let StreamEvent::TextDelta { delta } = &events[1] {
            assert_eq!(delta, "hello world");
        } else {
            panic!("expected TextDelta");
        }
        assert!(matches!(events[2], StreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn chunked_text_concatenates_in_done() {
        let mock = MockProvider::new(vec![MockResponse::stream_chunks(&["Hel", "lo"])]);
        let events = collect(&mock, &LlmContext::empty()).await;
        assert_eq!(events.len(), 4);
        match &events[3] {
            StreamEvent::Done { message, .. } => assert_eq!(message.text_content(), "Hello"),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_call_response_invokes_as_tool_calls() {
        let mock = MockProvider::new(vec![MockResponse::tool_call("search", json!({"q": "rust"}))]);
        let reply = mock
            .invoke(&LlmContext::empty(), &StreamOptions::default())
            .await
            .unwrap();
        match reply {
            ModelReply::ToolCalls { calls, .. } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "search");
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_response() {
        let mock = MockProvider::new(vec![MockResponse::Error(
            GatewayError::AuthenticationFailed("bad".into()),
        )]);
        let result = mock
            .stream(&LlmContext::empty(), &StreamOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn exhausted_responses() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("only one")]);
        let context = LlmContext::empty();

        let _ = mock.stream(&context, &StreamOptions::default()).await;
        let result = mock.stream(&context, &StreamOptions::default()).await;
        assert!(result.is_err());
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.remaining(), 0);
    }

    #[tokio::test]
    async fn repeating_never_runs_dry() {
        let mock = MockProvider::repeating(MockResponse::stream_text("again"));
        for _ in 0..5 {
            assert!(mock
                .stream(&LlmContext::empty(), &StreamOptions::default())
                .await
                .is_ok());
        }
        assert_eq!(mock.call_count(), 5);
    }

    #[tokio::test]
    async fn records_contexts() {
        let mock = MockProvider::new(vec![
            MockResponse::stream_text("a"),
            MockResponse::stream_text("b"),
        ]);
        let ctx = LlmContext {
            messages: vec![Message::user_text("first")],
            ..LlmContext::empty()
        };
        let _ = collect(&mock, &ctx).await;
        let _ = collect(&mock, &LlmContext::empty()).await;
        let contexts = mock.contexts();
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].last_user_text(), Some("first"));
        assert!(mock.last_context().unwrap().messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_response() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(50),
            MockResponse::stream_text("after delay"),
        )]);

        let start = tokio::time::Instant::now();
        let events = collect(&mock, &LlmContext::empty()).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(events.len(), 3);
    }
}
