//! End-to-end tests for the conversation loop.
//!
//! These drive a real `ResilientInvoker` over scripted `MockBackend`s, so
//! streaming, gating, dispatch and history folding are exercised together.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;

use hearth_agent::{
    AgentConfig, AgentError, AgentEvent, ConversationOrchestrator, DEFAULT_FALLBACK_ANSWER,
    DelegateTool, MockTool, MutationGate, ToolRegistry, ToolResult, TurnOutcome, event_channel,
};
use hearth_llm::{
    CallContext, CompletionResponse, ContentBlock, LlmError, Message, MockBackend, MockReply,
    ResilientInvoker, StopReason, Usage, text_response,
};

fn tool_calls(calls: &[(&str, &str)]) -> MockReply {
    let content = calls
        .iter()
        .map(|(id, name)| ContentBlock::tool_use(*id, *name, json!({"entity_id": "light.porch"})))
        .collect();
    MockReply::Response(CompletionResponse::new(
        "msg",
        "mock-model",
        content,
        StopReason::ToolUse,
        Usage::new(8, 4),
    ))
}

fn orchestrator(backend: Arc<MockBackend>, registry: ToolRegistry) -> ConversationOrchestrator {
    ConversationOrchestrator::new(
        Arc::new(ResilientInvoker::new(backend)),
        Arc::new(registry),
        AgentConfig::new("test-model"),
    )
}

fn drain(rx: &mut hearth_agent::EventReceiver) -> Vec<AgentEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_loop_terminates_against_model_that_never_stops() {
    let replies = (0..25)
        .map(|i| tool_calls(&[(format!("call_{}", i).as_str(), "get_entity_state")]))
        .collect();
    let backend = Arc::new(MockBackend::new(replies));
    let tool = Arc::new(MockTool::new("get_entity_state").with_response(ToolResult::text("on")));
    let mut registry = ToolRegistry::new();
    registry.register_arc(tool.clone());
    let orch = orchestrator(backend.clone(), registry);
    let (tx, mut rx) = event_channel();

    let result = orch
        .run(vec![Message::user("watch the porch")], &CallContext::new(), &tx)
        .await
        .unwrap();

    assert_eq!(result.iterations, 10);
    assert_eq!(backend.request_count(), 10);
    assert_eq!(tool.call_count(), 10);
    assert_eq!(
        result.outcome,
        TurnOutcome::Answer {
            text: DEFAULT_FALLBACK_ANSWER.to_string(),
            truncated: true,
        }
    );

    let events = drain(&mut rx);
    assert!(events.last().unwrap().is_state());
    assert_eq!(events.iter().filter(|e| e.is_state()).count(), 1);
}

#[tokio::test]
async fn test_custom_iteration_cap() {
    let replies = (0..5)
        .map(|i| tool_calls(&[(format!("call_{}", i).as_str(), "list_entities")]))
        .collect();
    let backend = Arc::new(MockBackend::new(replies));
    let mut registry = ToolRegistry::new();
    registry.register(MockTool::new("list_entities"));
    let orch = ConversationOrchestrator::new(
        Arc::new(ResilientInvoker::new(backend.clone())),
        Arc::new(registry),
        AgentConfig::new("test-model").with_max_tool_iterations(3),
    );
    let (tx, _rx) = event_channel();

    let result = orch
        .run(vec![Message::user("list")], &CallContext::new(), &tx)
        .await
        .unwrap();
    assert_eq!(result.iterations, 3);
    assert_eq!(backend.request_count(), 3);
}

#[tokio::test]
async fn test_mixed_round_halts_without_running_anything() {
    let backend = Arc::new(MockBackend::new(vec![tool_calls(&[
        ("c1", "get_entity_state"),
        ("c2", "control_entity"),
    ])]));
    let read = Arc::new(MockTool::new("get_entity_state"));
    let write = Arc::new(MockTool::new("control_entity"));
    let mut registry = ToolRegistry::new();
    registry.register_arc(read.clone());
    registry.register_arc(write.clone());
    let orch = orchestrator(backend.clone(), registry);
    let (tx, mut rx) = event_channel();

    let result = orch
        .run(vec![Message::user("turn on the porch light")], &CallContext::new(), &tx)
        .await
        .unwrap();

    assert_eq!(read.call_count(), 0);
    assert_eq!(write.call_count(), 0);
    assert_eq!(backend.request_count(), 1);

    let approval = result.approval().expect("approval request");
    assert!(approval.description.contains("get_entity_state"));
    assert!(approval.description.contains("control_entity"));
    // No visible text, so history is unchanged.
    assert_eq!(result.messages.len(), 1);

    let events = drain(&mut rx);
    let approvals: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, AgentEvent::ApprovalRequired { .. }))
        .collect();
    assert_eq!(approvals.len(), 1);
    assert!(!events.iter().any(|e| matches!(e, AgentEvent::ToolStart { .. })));
    assert!(events.last().unwrap().is_state());
}

#[tokio::test]
async fn test_extended_allow_list_lets_round_proceed() {
    let backend = Arc::new(MockBackend::new(vec![
        tool_calls(&[("c1", "get_energy_report")]),
        MockReply::Response(text_response("Usage is flat.")),
    ]));
    let mut registry = ToolRegistry::new();
    registry.register(MockTool::new("get_energy_report"));
    let orch = orchestrator(backend, registry)
        .with_gate(MutationGate::default().allow("get_energy_report"));
    let (tx, _rx) = event_channel();

    let result = orch
        .run(vec![Message::user("energy?")], &CallContext::new(), &tx)
        .await
        .unwrap();
    assert_eq!(result.answer(), Some("Usage is flat."));
}

#[tokio::test]
async fn test_stream_helper_yields_events_and_result() {
    let backend = Arc::new(MockBackend::new(vec![
        tool_calls(&[("c1", "get_entity_state")]),
        MockReply::Response(text_response("It is on.")),
    ]));
    let mut registry = ToolRegistry::new();
    registry.register(MockTool::new("get_entity_state").with_response(ToolResult::text("on")));
    let orch = Arc::new(orchestrator(backend, registry));

    let (stream, handle) = orch.stream(
        vec![Message::user("porch?")],
        CallContext::new().with_conversation("conv-1"),
    );
    let events: Vec<AgentEvent> = stream.collect().await;
    let result = handle.await.unwrap().unwrap();

    assert_eq!(
        events[..3],
        [
            AgentEvent::tool_start("get_entity_state"),
            AgentEvent::tool_end("get_entity_state", "on"),
            AgentEvent::token("It is on."),
        ]
    );
    match events.last() {
        Some(AgentEvent::State { messages }) => assert_eq!(messages, &result.messages),
        other => panic!("expected state event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dropping_stream_cancels_turn() {
    let backend = Arc::new(MockBackend::new(vec![MockReply::Response(text_response(
        "nobody is listening",
    ))]));
    let orch = Arc::new(orchestrator(backend, ToolRegistry::new()));

    let (stream, handle) = orch.stream(vec![Message::user("hi")], CallContext::new());
    drop(stream);

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_fallback_provider_answers_when_primary_rejected() {
    let auth = || MockReply::Fail(LlmError::Auth("expired key".to_string()));
    let primary = Arc::new(MockBackend::new(vec![auth(), auth(), auth()]).named("openai"));
    let fallback = Arc::new(
        MockBackend::new(vec![MockReply::Response(text_response("Fallback here."))])
            .named("gateway"),
    );
    let invoker = ResilientInvoker::new(primary.clone()).with_fallback(fallback.clone());
    let orch = ConversationOrchestrator::new(
        Arc::new(invoker),
        Arc::new(ToolRegistry::new()),
        AgentConfig::new("test-model"),
    );
    let (tx, _rx) = event_channel();

    let result = orch
        .run(vec![Message::user("hi")], &CallContext::new(), &tx)
        .await
        .unwrap();

    assert_eq!(result.answer(), Some("Fallback here."));
    assert_eq!(primary.request_count(), 3);
    assert_eq!(fallback.request_count(), 1);
}

#[tokio::test]
async fn test_delegated_sub_agent_progress_is_interleaved() {
    let sub_backend = Arc::new(MockBackend::new(vec![
        tool_calls(&[("s1", "get_history")]),
        MockReply::Response(text_response("Usage is normal.")),
    ]));
    let mut sub_registry = ToolRegistry::new();
    sub_registry.register(MockTool::new("get_history").with_response(ToolResult::text("42 kWh")));
    let analyst = Arc::new(orchestrator(sub_backend, sub_registry));

    let backend = Arc::new(MockBackend::new(vec![
        MockReply::Response(CompletionResponse::new(
            "msg",
            "mock-model",
            vec![ContentBlock::tool_use(
                "c1",
                "energy_analyst",
                json!({"task": "check energy"}),
            )],
            StopReason::ToolUse,
            Usage::new(8, 4),
        )),
        MockReply::Response(text_response("The analyst says usage is normal.")),
    ]));
    let mut registry = ToolRegistry::new();
    registry.register(DelegateTool::new("energy_analyst", "Analyse energy use", analyst));
    let orch = orchestrator(backend, registry)
        .with_gate(MutationGate::default().allow("energy_analyst"));
    let (tx, mut rx) = event_channel();

    let result = orch
        .run(vec![Message::user("energy?")], &CallContext::new(), &tx)
        .await
        .unwrap();
    assert_eq!(result.answer(), Some("The analyst says usage is normal."));

    let events = drain(&mut rx);
    assert_eq!(
        events[..4],
        [
            AgentEvent::tool_start("energy_analyst"),
            AgentEvent::tool_start("get_history"),
            AgentEvent::tool_end("get_history", "42 kWh"),
            AgentEvent::tool_end("energy_analyst", "Usage is normal."),
        ]
    );
}
