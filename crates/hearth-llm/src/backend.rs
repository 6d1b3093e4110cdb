//! LLM Backend trait, streaming vocabulary, and a scripted mock.
//!
//! Every provider implements [`LlmBackend`]. Streaming responses are a
//! [`ResponseStream`] of [`StreamEvent`]s; tool invocations arrive as
//! [`ToolCallFragment`]s that may be split across many events and interleaved
//! with other calls.

use async_trait::async_trait;
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{LlmError, Result};
use crate::types::{CompletionRequest, CompletionResponse, ContentBlock, StopReason, Usage};

// ─────────────────────────────────────────────────────────────────────────────
// Streaming Types
// ─────────────────────────────────────────────────────────────────────────────

/// A streaming response from an LLM backend.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send + 'static>>;

/// Events emitted during streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Message started.
    MessageStart { id: String, model: String },
    /// Text being streamed (may contain reasoning markers).
    TextDelta(String),
    /// A piece of a tool invocation.
    ToolCallDelta(ToolCallFragment),
    /// Message finished with final usage stats.
    MessageDelta {
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Message complete.
    MessageStop,
    /// Keep-alive.
    Ping,
    /// Provider reported an error inside the stream.
    Error { message: String },
}

impl StreamEvent {
    /// Create a text delta event.
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta(text.into())
    }
}

/// One streamed piece of a tool invocation.
///
/// Fragments sharing a `call_id` belong to the same call. `sequence_index`
/// orders the fragments of one call, so calls can be rebuilt no matter how
/// the fragments of different calls were interleaved on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub call_id: String,
    pub name_part: String,
    pub args_part: String,
    pub sequence_index: usize,
}

impl ToolCallFragment {
    /// Create a fragment.
    pub fn new(
        call_id: impl Into<String>,
        sequence_index: usize,
        name_part: impl Into<String>,
        args_part: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name_part: name_part.into(),
            args_part: args_part.into(),
            sequence_index,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM Backend Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for LLM backend providers.
///
/// Requests are passed by value and carry the full structured history, so a
/// caller can clone and re-send the same request on retry or to a different
/// backend. Tool binding is part of the request (`CompletionRequest::tools`).
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Execute a completion request and return the full response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Execute a completion request and return a stream of events.
    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream>;

    /// Provider id of this backend. Circuit breakers are keyed by it.
    fn name(&self) -> &str;

    /// Model this backend is pinned to, if any. Overrides `CompletionRequest::model`
    /// when the invoker routes a request here.
    fn model(&self) -> Option<&str> {
        None
    }
}

/// A backend that can be shared across tasks.
pub type SharedBackend = Arc<dyn LlmBackend>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock Backend
// ─────────────────────────────────────────────────────────────────────────────

/// A scripted reply for [`MockBackend`].
#[derive(Debug)]
pub enum MockReply {
    /// A complete response (streamed as text + tool fragments when requested).
    Response(CompletionResponse),
    /// A literal event sequence for `complete_stream`.
    Events(Vec<StreamEvent>),
    /// Fail the call (or the stream setup) with this error.
    Fail(LlmError),
    /// Deliver these events, then fail the stream with this error.
    FailMidStream {
        events: Vec<StreamEvent>,
        error: LlmError,
    },
}

/// A mock backend for testing purposes.
///
/// Replies are consumed in order by both `complete` and `complete_stream`. If
/// more requests are made than replies are available, an error is returned.
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    model: Option<String>,
    replies: parking_lot::Mutex<VecDeque<MockReply>>,
    request_log: parking_lot::Mutex<Vec<CompletionRequest>>,
}

impl MockBackend {
    /// Create a new mock backend with the given replies.
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            name: "mock".to_string(),
            model: None,
            replies: parking_lot::Mutex::new(replies.into()),
            request_log: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Create a mock backend with a single text response.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self::new(vec![MockReply::Response(text_response(text))])
    }

    /// Set the provider id reported by `name()`.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Pin the model reported by `model()`.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Get all requests that were made to this backend.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.request_log.lock().clone()
    }

    /// Get the number of requests made.
    pub fn request_count(&self) -> usize {
        self.request_log.lock().len()
    }

    fn next_reply(&self, request: CompletionRequest) -> Result<MockReply> {
        self.request_log.lock().push(request);
        self.replies.lock().pop_front().ok_or_else(|| {
            LlmError::Backend("MockBackend: no more replies available".to_string())
        })
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        match self.next_reply(request)? {
            MockReply::Response(response) => Ok(response),
            MockReply::Fail(error) | MockReply::FailMidStream { error, .. } => Err(error),
            MockReply::Events(_) => Err(LlmError::Internal(
                "MockBackend: event reply cannot serve complete()".to_string(),
            )),
        }
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream> {
        let items: Vec<Result<StreamEvent>> = match self.next_reply(request)? {
            MockReply::Response(response) => response_events(&response).into_iter().map(Ok).collect(),
            MockReply::Events(events) => events.into_iter().map(Ok).collect(),
            MockReply::Fail(error) => return Err(error),
            MockReply::FailMidStream { events, error } => events
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(error)))
                .collect(),
        };

        Ok(Box::pin(futures::stream::iter(items)))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }
}

/// Build a plain text response.
pub fn text_response(text: impl Into<String>) -> CompletionResponse {
    CompletionResponse::new(
        "mock_msg",
        "mock-model",
        vec![ContentBlock::text(text)],
        StopReason::EndTurn,
        Usage::new(10, 20),
    )
}

/// Render a complete response as the event sequence a provider would stream.
///
/// Each tool use becomes a single fragment carrying its whole name and
/// serialized arguments.
pub fn response_events(response: &CompletionResponse) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::MessageStart {
        id: response.id.clone(),
        model: response.model.clone(),
    }];

    for block in &response.content {
        match block {
            ContentBlock::Text { text } => events.push(StreamEvent::TextDelta(text.clone())),
            ContentBlock::ToolUse { id, name, input } => {
                events.push(StreamEvent::ToolCallDelta(ToolCallFragment::new(
                    id.clone(),
                    0,
                    name.clone(),
                    input.to_string(),
                )))
            }
            ContentBlock::ToolResult { .. } => {}
        }
    }

    events.push(StreamEvent::MessageDelta {
        stop_reason: response.stop_reason.unwrap_or(StopReason::EndTurn),
        usage: response.usage,
    });
    events.push(StreamEvent::MessageStop);
    events
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use futures::StreamExt;

    fn request() -> CompletionRequest {
        CompletionRequest::new("test-model", vec![Message::user("Hi")], 100)
    }

    #[tokio::test]
    async fn test_mock_backend_single_response() {
        let backend = MockBackend::with_text("Hello!");

        let response = backend.complete(request()).await.unwrap();

        assert_eq!(response.text(), "Hello!");
        assert_eq!(backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_backend_exhausted() {
        let backend = MockBackend::new(vec![]);
        assert!(backend.complete(request()).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_backend_fail_then_succeed() {
        let backend = MockBackend::new(vec![
            MockReply::Fail(LlmError::Network("reset".to_string())),
            MockReply::Response(text_response("ok")),
        ])
        .named("primary");

        assert!(backend.complete(request()).await.is_err());
        assert_eq!(backend.complete(request()).await.unwrap().text(), "ok");
        assert_eq!(backend.name(), "primary");
        assert_eq!(backend.request_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_backend_stream_renders_tool_use() {
        let backend = MockBackend::new(vec![MockReply::Response(CompletionResponse::new(
            "msg_1",
            "model",
            vec![
                ContentBlock::text("Checking."),
                ContentBlock::tool_use(
                    "call_1",
                    "get_entity_state",
                    serde_json::json!({"entity_id": "light.porch"}),
                ),
            ],
            StopReason::ToolUse,
            Usage::new(5, 5),
        ))]);

        let events: Vec<_> = backend
            .complete_stream(request())
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert_eq!(events[1], StreamEvent::text("Checking."));
        match &events[2] {
            StreamEvent::ToolCallDelta(fragment) => {
                assert_eq!(fragment.call_id, "call_1");
                assert_eq!(fragment.name_part, "get_entity_state");
                assert!(fragment.args_part.contains("light.porch"));
            }
            other => panic!("expected tool fragment, got {:?}", other),
        }
        assert_eq!(events[4], StreamEvent::MessageStop);
    }

    #[tokio::test]
    async fn test_mock_backend_mid_stream_failure() {
        let backend = MockBackend::new(vec![MockReply::FailMidStream {
            events: vec![StreamEvent::text("partial")],
            error: LlmError::Network("dropped".to_string()),
        }]);

        let mut stream = backend.complete_stream(request()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), StreamEvent::text("partial"));
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }
}
