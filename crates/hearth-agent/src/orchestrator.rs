//! Conversation orchestrator.
//!
//! Drives one conversation turn as a bounded loop of model rounds:
//!
//! ```text
//! Streaming ──no calls──────────────▶ Done
//!     │
//!     ├──all read-only──▶ Dispatching ──▶ Streaming
//!     │
//!     └──any mutating───▶ AwaitingApproval
//! ```
//!
//! Every round streams the model output through a [`TagFilter`] and a
//! [`ToolCallAssembler`] at the same time; visible text reaches the event
//! channel as soon as the filter releases it. The loop stops after
//! `max_tool_iterations` rounds no matter what the model asks for.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;

use hearth_llm::{
    CallContext, CompletionRequest, ContentBlock, LlmError, Message, ResilientInvoker, StreamEvent,
};

use crate::assembler::{ToolCallAssembler, ToolCallRequest};
use crate::dispatcher::{DispatchTimeouts, ToolDispatcher, emit};
use crate::error::Result;
use crate::event::{AgentEvent, AgentStream, EventSender, event_channel, into_stream};
use crate::gate::{ApprovalRequest, GateDecision, MutationGate};
use crate::tag_filter::TagFilter;
use crate::tool::ToolRegistry;
use crate::types::AgentConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Turn Outcome
// ─────────────────────────────────────────────────────────────────────────────

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The model answered. `truncated` is set when the round cap was hit.
    Answer { text: String, truncated: bool },
    /// A mutating call was requested; nothing from that round ran.
    AwaitingApproval(ApprovalRequest),
}

/// Result of [`ConversationOrchestrator::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub outcome: TurnOutcome,
    /// Full updated history, as also sent in the final state event.
    pub messages: Vec<Message>,
    /// Model rounds used.
    pub iterations: u32,
}

impl TurnResult {
    /// The answer text, if the turn produced one.
    pub fn answer(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::Answer { text, .. } => Some(text),
            TurnOutcome::AwaitingApproval(_) => None,
        }
    }

    pub fn approval(&self) -> Option<&ApprovalRequest> {
        match &self.outcome {
            TurnOutcome::AwaitingApproval(request) => Some(request),
            TurnOutcome::Answer { .. } => None,
        }
    }
}

#[derive(Debug)]
enum ConversationState {
    Streaming,
    Dispatching(Vec<ToolCallRequest>),
    AwaitingApproval(ApprovalRequest),
    Done { truncated: bool },
}

/// What one streamed round produced.
#[derive(Debug, Default)]
struct RoundOutput {
    visible: String,
    calls: Vec<ToolCallRequest>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Runs conversation turns against a [`ResilientInvoker`] and a tool registry.
///
/// Holds no per-conversation state; history is passed in and handed back, so
/// one orchestrator can serve many conversations.
#[derive(Debug, Clone)]
pub struct ConversationOrchestrator {
    invoker: Arc<ResilientInvoker>,
    registry: Arc<ToolRegistry>,
    gate: MutationGate,
    dispatcher: ToolDispatcher,
    config: AgentConfig,
}

impl ConversationOrchestrator {
    pub fn new(invoker: Arc<ResilientInvoker>, registry: Arc<ToolRegistry>, config: AgentConfig) -> Self {
        Self {
            dispatcher: ToolDispatcher::new(Arc::clone(&registry)),
            invoker,
            registry,
            gate: MutationGate::default(),
            config,
        }
    }

    /// Replace the read-only allow-list.
    pub fn with_gate(mut self, gate: MutationGate) -> Self {
        self.gate = gate;
        self
    }

    /// Set per-class tool timeouts.
    pub fn with_timeouts(mut self, timeouts: DispatchTimeouts) -> Self {
        self.dispatcher = self.dispatcher.with_timeouts(timeouts);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &MutationGate {
        &self.gate
    }

    /// Spawn a turn and return its event stream plus a handle for the result.
    ///
    /// Dropping the stream cancels the turn at its next emitted event.
    pub fn stream(
        self: Arc<Self>,
        messages: Vec<Message>,
        ctx: CallContext,
    ) -> (AgentStream, JoinHandle<Result<TurnResult>>) {
        let (tx, rx) = event_channel();
        let handle = tokio::spawn(async move { self.run(messages, &ctx, &tx).await });
        (into_stream(rx), handle)
    }

    /// Run one turn on top of `messages`.
    ///
    /// Returns an error only when the model could not be reached after every
    /// retry and fallback, or when the event receiver went away. Tool
    /// failures are fed back to the model instead.
    pub async fn run(
        &self,
        messages: Vec<Message>,
        ctx: &CallContext,
        events: &EventSender,
    ) -> Result<TurnResult> {
        let mut history = messages;
        let mut answer = String::new();
        let mut iterations = 0u32;
        let max_iterations = self.config.max_tool_iterations.max(1);

        tracing::info!(
            conversation_id = ctx.conversation_id.as_deref().unwrap_or("-"),
            agent_role = ctx.agent_role.as_deref().unwrap_or("-"),
            messages = history.len(),
            tools = self.registry.len(),
            "Turn started"
        );

        let mut state = ConversationState::Streaming;
        let outcome = loop {
            state = match state {
                ConversationState::Streaming if iterations >= max_iterations => {
                    tracing::warn!(iterations, "Max tool iterations reached");
                    ConversationState::Done { truncated: true }
                }
                ConversationState::Streaming => {
                    iterations += 1;
                    let round = self.stream_round(&history, ctx, events, iterations).await?;
                    answer.push_str(&round.visible);
                    self.after_round(round, &mut history, events)?
                }
                ConversationState::Dispatching(calls) => {
                    let results = self.dispatcher.dispatch(calls, ctx, events).await?;
                    history.push(Message::tool_results(
                        results.iter().map(|r| r.to_result_block()).collect(),
                    ));
                    ConversationState::Streaming
                }
                ConversationState::AwaitingApproval(request) => {
                    break TurnOutcome::AwaitingApproval(request);
                }
                ConversationState::Done { truncated } => {
                    if !has_text(&answer) {
                        answer = self.config.fallback_answer.clone();
                        emit(events, AgentEvent::token(&answer))?;
                        history.push(Message::assistant(&answer));
                    }
                    break TurnOutcome::Answer {
                        text: answer,
                        truncated,
                    };
                }
            };
        };

        tracing::info!(
            iterations,
            messages = history.len(),
            awaiting_approval = matches!(outcome, TurnOutcome::AwaitingApproval(_)),
            "Turn completed"
        );

        emit(
            events,
            AgentEvent::State {
                messages: history.clone(),
            },
        )?;

        Ok(TurnResult {
            outcome,
            messages: history,
            iterations,
        })
    }

    /// Fold a finished round into history and pick the next state.
    fn after_round(
        &self,
        round: RoundOutput,
        history: &mut Vec<Message>,
        events: &EventSender,
    ) -> Result<ConversationState> {
        let RoundOutput { visible, calls } = round;

        if calls.is_empty() {
            if has_text(&visible) {
                history.push(Message::assistant(visible));
            }
            return Ok(ConversationState::Done { truncated: false });
        }

        match self.gate.evaluate(calls) {
            GateDecision::Proceed(calls) => {
                let mut blocks = Vec::with_capacity(calls.len() + 1);
                if has_text(&visible) {
                    blocks.push(ContentBlock::text(visible));
                }
                blocks.extend(calls.iter().map(ToolCallRequest::to_content_block));
                history.push(Message::assistant_blocks(blocks));
                Ok(ConversationState::Dispatching(calls))
            }
            GateDecision::Halt(request) => {
                if has_text(&visible) {
                    history.push(Message::assistant(visible));
                }
                emit(
                    events,
                    AgentEvent::ApprovalRequired {
                        description: request.description.clone(),
                    },
                )?;
                Ok(ConversationState::AwaitingApproval(request))
            }
        }
    }

    /// Stream one model round, forwarding tokens as they are released.
    async fn stream_round(
        &self,
        history: &[Message],
        ctx: &CallContext,
        events: &EventSender,
        iteration: u32,
    ) -> Result<RoundOutput> {
        let request = self.build_request(history);

        tracing::debug!(
            iteration,
            messages = request.messages.len(),
            tools = request.tools.len(),
            model = %request.model,
            "Calling LLM"
        );

        let mut stream = self.invoker.invoke_stream(request, ctx).await?;
        let mut filter = TagFilter::new(self.config.reasoning_markers.clone());
        let mut assembler = ToolCallAssembler::new();
        let mut output = RoundOutput::default();

        // Drain to the end so the invoker can report usage.
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta(text) => {
                    for token in filter.push(&text) {
                        forward(token, &mut output.visible, events)?;
                    }
                }
                StreamEvent::ToolCallDelta(fragment) => assembler.push(fragment),
                StreamEvent::MessageDelta { stop_reason, usage } => {
                    tracing::debug!(
                        iteration,
                        ?stop_reason,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "LLM response received"
                    );
                }
                StreamEvent::Error { message } => return Err(LlmError::Backend(message).into()),
                StreamEvent::MessageStart { .. } | StreamEvent::MessageStop | StreamEvent::Ping => {}
            }
        }

        for token in filter.finish() {
            forward(token, &mut output.visible, events)?;
        }

        let fragments_seen = assembler.len();
        output.calls = assembler.finish();
        if output.calls.len() < fragments_seen {
            tracing::debug!(
                iteration,
                dropped = fragments_seen - output.calls.len(),
                "Discarded malformed tool calls"
            );
        }

        Ok(output)
    }

    fn build_request(&self, history: &[Message]) -> CompletionRequest {
        let mut request =
            CompletionRequest::new(&self.config.model, history.to_vec(), self.config.max_tokens)
                .with_streaming();

        if let Some(ref system) = self.config.system_prompt {
            request = request.with_system(system);
        }
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        if !self.registry.is_empty() {
            request = request.with_tools(self.registry.to_llm_definitions());
        }

        request
    }
}

/// Whitespace-only output counts as no answer.
fn has_text(text: &str) -> bool {
    !text.trim().is_empty()
}

fn forward(
    token: crate::tag_filter::StreamToken,
    visible: &mut String,
    events: &EventSender,
) -> Result<()> {
    if token.is_internal {
        emit(events, AgentEvent::internal(token.text))
    } else {
        visible.push_str(&token.text);
        emit(events, AgentEvent::token(token.text))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventReceiver;
    use crate::tool::{MockTool, ToolResult};
    use hearth_llm::{
        CompletionResponse, MockBackend, MockReply, Role, StopReason, ToolCallFragment, Usage,
    };
    use serde_json::json;

    fn tool_use_response(id: &str, name: &str, args: serde_json::Value) -> MockReply {
        MockReply::Response(CompletionResponse::new(
            "msg",
            "mock-model",
            vec![ContentBlock::tool_use(id, name, args)],
            StopReason::ToolUse,
            Usage::new(5, 5),
        ))
    }

    fn text_reply(text: &str) -> MockReply {
        MockReply::Response(hearth_llm::text_response(text))
    }

    fn orchestrator(backend: Arc<MockBackend>, tools: Vec<MockTool>) -> ConversationOrchestrator {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        ConversationOrchestrator::new(
            Arc::new(ResilientInvoker::new(backend)),
            Arc::new(registry),
            AgentConfig::new("test-model"),
        )
    }

    fn drain(rx: &mut EventReceiver) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_plain_answer() {
        let backend = Arc::new(MockBackend::new(vec![text_reply("The porch light is on.")]));
        let orch = orchestrator(backend.clone(), vec![]);
        let (tx, mut rx) = event_channel();

        let result = orch
            .run(vec![Message::user("Is the porch light on?")], &CallContext::new(), &tx)
            .await
            .unwrap();

        assert_eq!(result.answer(), Some("The porch light is on."));
        assert_eq!(result.iterations, 1);
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages[1].role, Role::Assistant);

        let events = drain(&mut rx);
        assert_eq!(events[0], AgentEvent::token("The porch light is on."));
        assert!(events.last().unwrap().is_state());
        assert!(backend.requests()[0].stream);
        assert!(backend.requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn test_reasoning_is_kept_out_of_answer_and_history() {
        let backend = Arc::new(MockBackend::new(vec![MockReply::Events(vec![
            StreamEvent::text("<thi"),
            StreamEvent::text("nk>user wants state</think>It is "),
            StreamEvent::text("off."),
            StreamEvent::MessageStop,
        ])]));
        let orch = orchestrator(backend, vec![]);
        let (tx, mut rx) = event_channel();

        let result = orch
            .run(vec![Message::user("porch?")], &CallContext::new(), &tx)
            .await
            .unwrap();

        assert_eq!(result.answer(), Some("It is off."));
        assert_eq!(result.messages[1].content.to_text(), "It is off.");
        assert!(drain(&mut rx).contains(&AgentEvent::internal("user wants state")));
    }

    #[tokio::test]
    async fn test_read_only_round_dispatches_and_loops() {
        let backend = Arc::new(MockBackend::new(vec![
            tool_use_response("c1", "get_entity_state", json!({"entity_id": "light.porch"})),
            text_reply("It is on."),
        ]));
        let tool = MockTool::new("get_entity_state").with_response(ToolResult::text("on"));
        let orch = orchestrator(backend.clone(), vec![tool]);
        let (tx, mut rx) = event_channel();

        let result = orch
            .run(vec![Message::user("porch?")], &CallContext::new(), &tx)
            .await
            .unwrap();

        assert_eq!(result.answer(), Some("It is on."));
        assert_eq!(result.iterations, 2);
        // user, assistant(tool_use), tool results, assistant
        assert_eq!(result.messages.len(), 4);

        let second = &backend.requests()[1];
        assert_eq!(second.messages.len(), 3);
        assert_eq!(second.tools.len(), 1);

        let events = drain(&mut rx);
        assert!(events.contains(&AgentEvent::tool_start("get_entity_state")));
        assert!(events.contains(&AgentEvent::tool_end("get_entity_state", "on")));
    }

    #[tokio::test]
    async fn test_fragmented_tool_call_is_reassembled() {
        let backend = Arc::new(MockBackend::new(vec![
            MockReply::Events(vec![
                StreamEvent::ToolCallDelta(ToolCallFragment::new("c1", 0, "list_", "{\"area\"")),
                StreamEvent::ToolCallDelta(ToolCallFragment::new("c1", 1, "entities", ": \"porch\"}")),
                StreamEvent::MessageStop,
            ]),
            text_reply("Two lights."),
        ]));
        let tool = Arc::new(MockTool::new("list_entities"));
        let mut registry = ToolRegistry::new();
        registry.register_arc(tool.clone());
        let orch = ConversationOrchestrator::new(
            Arc::new(ResilientInvoker::new(backend)),
            Arc::new(registry),
            AgentConfig::new("test-model"),
        );
        let (tx, _rx) = event_channel();

        let result = orch
            .run(vec![Message::user("porch?")], &CallContext::new(), &tx)
            .await
            .unwrap();

        assert_eq!(result.answer(), Some("Two lights."));
        assert_eq!(tool.calls(), vec![json!({"area": "porch"})]);
    }

    #[tokio::test]
    async fn test_malformed_call_is_ignored() {
        let backend = Arc::new(MockBackend::new(vec![MockReply::Events(vec![
            StreamEvent::text("Let me check."),
            StreamEvent::ToolCallDelta(ToolCallFragment::new("c1", 0, "get_history", "{not json")),
            StreamEvent::MessageStop,
        ])]));
        let orch = orchestrator(backend.clone(), vec![MockTool::new("get_history")]);
        let (tx, _rx) = event_channel();

        let result = orch
            .run(vec![Message::user("history?")], &CallContext::new(), &tx)
            .await
            .unwrap();

        assert_eq!(result.answer(), Some("Let me check."));
        assert_eq!(backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_answer_gets_fallback() {
        let backend = Arc::new(MockBackend::new(vec![MockReply::Events(vec![
            StreamEvent::text("<think>nothing to say</think>"),
            StreamEvent::MessageStop,
        ])]));
        let orch = orchestrator(backend, vec![]);
        let (tx, mut rx) = event_channel();

        let result = orch
            .run(vec![Message::user("ok")], &CallContext::new(), &tx)
            .await
            .unwrap();

        let fallback = crate::types::DEFAULT_FALLBACK_ANSWER;
        assert_eq!(result.answer(), Some(fallback));
        assert_eq!(result.messages.last().unwrap().content.to_text(), fallback);
        assert!(drain(&mut rx).contains(&AgentEvent::token(fallback)));
    }

    #[tokio::test]
    async fn test_whitespace_answer_is_replaced_not_appended() {
        let backend = Arc::new(MockBackend::new(vec![text_reply("  ")]));
        let orch = orchestrator(backend, vec![]);
        let (tx, _rx) = event_channel();

        let result = orch
            .run(vec![Message::user("ok")], &CallContext::new(), &tx)
            .await
            .unwrap();

        let fallback = crate::types::DEFAULT_FALLBACK_ANSWER;
        assert_eq!(result.answer(), Some(fallback));
        let roles: Vec<Role> = result.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(result.messages[1].content.to_text(), fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_failure_surfaces_as_error() {
        let auth = || MockReply::Fail(LlmError::Auth("bad key".to_string()));
        let backend = Arc::new(MockBackend::new(vec![auth(), auth(), auth()]));
        let orch = orchestrator(backend, vec![]);
        let (tx, _rx) = event_channel();

        let err = orch
            .run(vec![Message::user("hi")], &CallContext::new(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::AgentError::Llm(LlmError::Auth(_))));
    }
}
