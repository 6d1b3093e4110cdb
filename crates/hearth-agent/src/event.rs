//! Outward event vocabulary of a conversation.
//!
//! Events are the only contract with whatever transport sits in front of the
//! orchestrator. They serialize as tagged JSON so a boundary layer can forward
//! them as-is:
//!
//! ```json
//! {"type": "token", "text": "The porch light is "}
//! {"type": "tool_start", "name": "get_entity_state"}
//! ```

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::sync::mpsc;

use hearth_llm::Message;

/// Maximum length of `ToolEnd::result_summary`, in characters.
pub const RESULT_SUMMARY_CHARS: usize = 200;

/// An event emitted while a conversation turn runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Visible text delta.
    Token { text: String },
    /// Internal reasoning delta. Never part of the answer or history.
    Internal { text: String },
    /// A tool call started.
    ToolStart { name: String },
    /// A tool call settled.
    ToolEnd { name: String, result_summary: String },
    /// The round contained a mutating call and halted.
    ApprovalRequired { description: String },
    /// Final message history. Always the last event of a completed turn.
    State { messages: Vec<Message> },
}

impl AgentEvent {
    pub fn token(text: impl Into<String>) -> Self {
        Self::Token { text: text.into() }
    }

    pub fn internal(text: impl Into<String>) -> Self {
        Self::Internal { text: text.into() }
    }

    pub fn tool_start(name: impl Into<String>) -> Self {
        Self::ToolStart { name: name.into() }
    }

    /// Tool end with the output cut to [`RESULT_SUMMARY_CHARS`].
    pub fn tool_end(name: impl Into<String>, output: &str) -> Self {
        Self::ToolEnd {
            name: name.into(),
            result_summary: summarize(output),
        }
    }

    /// Returns true for the terminal state event.
    pub fn is_state(&self) -> bool {
        matches!(self, Self::State { .. })
    }
}

fn summarize(output: &str) -> String {
    let mut chars = output.chars();
    let head: String = chars.by_ref().take(RESULT_SUMMARY_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

/// Sender half of a conversation's event channel.
pub type EventSender = mpsc::UnboundedSender<AgentEvent>;

/// Receiver half of a conversation's event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<AgentEvent>;

/// A boxed stream of agent events.
pub type AgentStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send + 'static>>;

/// Create an event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Adapt a receiver into an [`AgentStream`]. Dropping the stream closes the channel.
pub fn into_stream(mut rx: EventReceiver) -> AgentStream {
    Box::pin(async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield event;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(AgentEvent::tool_start("get_entity_state")).unwrap();
        assert_eq!(json["type"], "tool_start");
        assert_eq!(json["name"], "get_entity_state");

        let json = serde_json::to_value(AgentEvent::ApprovalRequired {
            description: "turn on porch light".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "approval_required");
    }

    #[test]
    fn test_tool_end_summary_is_bounded() {
        let long = "x".repeat(500);
        match AgentEvent::tool_end("t", &long) {
            AgentEvent::ToolEnd { result_summary, .. } => {
                assert_eq!(result_summary.chars().count(), RESULT_SUMMARY_CHARS + 1);
                assert!(result_summary.ends_with('…'));
            }
            other => panic!("unexpected {:?}", other),
        }

        match AgentEvent::tool_end("t", "on") {
            AgentEvent::ToolEnd { result_summary, .. } => assert_eq!(result_summary, "on"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_into_stream_ends_when_sender_dropped() {
        use futures::StreamExt;

        let (tx, rx) = event_channel();
        tx.send(AgentEvent::token("hi")).unwrap();
        drop(tx);

        let events: Vec<_> = into_stream(rx).collect().await;
        assert_eq!(events, vec![AgentEvent::token("hi")]);
    }
}
