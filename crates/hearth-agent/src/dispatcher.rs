//! Concurrent execution of one round of gated tool calls.
//!
//! Every call runs under its own timeout. Failures, panics and timeouts all
//! become textual results for the model; the round ends only when every call
//! has settled. Progress events published by running tools are forwarded as
//! soon as they arrive, interleaved with the round's start/end events.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use hearth_llm::{CallContext, ToolResultBlock};

use crate::assembler::ToolCallRequest;
use crate::error::{AgentError, Result};
use crate::event::{AgentEvent, EventSender, event_channel};
use crate::tool::{ToolClass, ToolContext, ToolRegistry, ToolResult};

/// Default timeout for ordinary tools.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for tools that run a nested agent.
pub const DEFAULT_DELEGATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-class timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTimeouts {
    pub standard: Duration,
    pub delegating: Duration,
}

impl Default for DispatchTimeouts {
    fn default() -> Self {
        Self {
            standard: DEFAULT_TOOL_TIMEOUT,
            delegating: DEFAULT_DELEGATE_TIMEOUT,
        }
    }
}

impl DispatchTimeouts {
    pub fn new(standard: Duration, delegating: Duration) -> Self {
        Self {
            standard,
            delegating,
        }
    }

    pub fn for_class(&self, class: ToolClass) -> Duration {
        match class {
            ToolClass::Standard => self.standard,
            ToolClass::Delegating => self.delegating,
        }
    }
}

/// Outcome of one dispatched call. Lives for a single round.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub call_id: String,
    pub tool_name: String,
    /// Text fed back to the model, including for failures.
    pub output_text: String,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ToolExecutionResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// History block carrying this result.
    pub fn to_result_block(&self) -> ToolResultBlock {
        if self.is_error() {
            ToolResultBlock::error(&self.call_id, &self.output_text)
        } else {
            ToolResultBlock::success(&self.call_id, &self.output_text)
        }
    }

    fn failed(call: &ToolCallRequest, message: String, elapsed_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output_text: format!("Error: {}", message),
            error: Some(message),
            elapsed_ms,
        }
    }
}

/// Runs gated calls against a [`ToolRegistry`].
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeouts: DispatchTimeouts,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            timeouts: DispatchTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: DispatchTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn timeouts(&self) -> DispatchTimeouts {
        self.timeouts
    }

    /// Execute a round concurrently and wait for every call to settle.
    ///
    /// Results come back in completion order. Fails only with
    /// [`AgentError::Cancelled`] when `events` has no receiver; any calls
    /// still running are dropped with the round.
    pub async fn dispatch(
        &self,
        calls: Vec<ToolCallRequest>,
        ctx: &CallContext,
        events: &EventSender,
    ) -> Result<Vec<ToolExecutionResult>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!(
            tool_count = calls.len(),
            tools = %calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", "),
            "Dispatching tools"
        );

        for call in &calls {
            emit(events, AgentEvent::tool_start(&call.name))?;
        }

        let (progress_tx, mut progress_rx) = event_channel();
        let mut pending: FuturesUnordered<_> = calls
            .into_iter()
            .map(|call| self.run_one(call, ctx.clone(), progress_tx.clone()))
            .collect();
        drop(progress_tx);

        let mut results = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            tokio::select! {
                biased;
                Some(event) = progress_rx.recv() => emit(events, event)?,
                Some(result) = pending.next() => {
                    // Progress sent during the final poll belongs before the end event.
                    while let Ok(event) = progress_rx.try_recv() {
                        emit(events, event)?;
                    }
                    emit(events, AgentEvent::tool_end(&result.tool_name, &result.output_text))?;
                    results.push(result);
                }
                else => break,
            }
        }
        while let Ok(event) = progress_rx.try_recv() {
            emit(events, event)?;
        }

        Ok(results)
    }

    async fn run_one(
        &self,
        call: ToolCallRequest,
        ctx: CallContext,
        progress: EventSender,
    ) -> ToolExecutionResult {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        let Some(tool) = self.registry.get(&call.name) else {
            tracing::warn!(tool = %call.name, call_id = %call.id, "Tool not found");
            let message = AgentError::ToolNotFound(call.name.clone()).to_string();
            return ToolExecutionResult::failed(&call, message, elapsed_ms());
        };

        let timeout = self.timeouts.for_class(tool.class());
        let token = CancellationToken::new();
        let tool_ctx = ToolContext::new(ctx, &call.id)
            .with_progress(progress)
            .with_cancellation(token.clone());

        tracing::debug!(
            tool = %call.name,
            call_id = %call.id,
            timeout_ms = timeout.as_millis() as u64,
            "Tool: executing"
        );

        let execution = AssertUnwindSafe(tool.execute(call.args.clone(), &tool_ctx)).catch_unwind();
        let outcome = tokio::time::timeout(timeout, execution).await;

        let result = match outcome {
            Err(_) => {
                token.cancel();
                tracing::warn!(
                    tool = %call.name,
                    call_id = %call.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Tool timed out"
                );
                let message = format!(
                    "Tool '{}' timed out after {}s",
                    call.name,
                    timeout.as_secs_f64()
                );
                ToolExecutionResult::failed(&call, message, elapsed_ms())
            }
            Ok(Err(_panic)) => {
                tracing::error!(tool = %call.name, call_id = %call.id, "Tool panicked");
                let message = format!("Tool '{}' failed unexpectedly", call.name);
                ToolExecutionResult::failed(&call, message, elapsed_ms())
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool execution failed");
                ToolExecutionResult::failed(&call, e.to_string(), elapsed_ms())
            }
            Ok(Ok(Ok(result))) => {
                let output_text = result.to_llm_content();
                let error = match &result {
                    ToolResult::Error { message } => Some(message.clone()),
                    _ => None,
                };
                ToolExecutionResult {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    output_text,
                    error,
                    elapsed_ms: elapsed_ms(),
                }
            }
        };

        tracing::debug!(
            tool = %result.tool_name,
            call_id = %result.call_id,
            success = !result.is_error(),
            output_bytes = result.output_text.len(),
            elapsed_ms = result.elapsed_ms,
            "Tool: completed"
        );

        result
    }
}

/// Forward an event, treating a closed channel as cancellation.
pub(crate) fn emit(events: &EventSender, event: AgentEvent) -> Result<()> {
    events.send(event).map_err(|_| AgentError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{MockTool, Tool};
    use async_trait::async_trait;
    use serde_json::json;

    fn call(id: &str, name: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, name, json!({}))
    }

    fn drain(rx: &mut crate::event::EventReceiver) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    struct PanickingTool;

    #[async_trait]
    impl Tool for PanickingTool {
        fn name(&self) -> &str {
            "get_area_summary"
        }
        fn description(&self) -> &str {
            "panics"
        }
        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _: serde_json::Value, _: &ToolContext) -> Result<ToolResult> {
            panic!("boom");
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "get_logbook"
        }
        fn description(&self) -> &str {
            "fails"
        }
        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _: serde_json::Value, _: &ToolContext) -> Result<ToolResult> {
            Err(AgentError::tool("logbook unavailable"))
        }
    }

    /// Reports a nested lifecycle before answering.
    struct ReportingTool;

    #[async_trait]
    impl Tool for ReportingTool {
        fn name(&self) -> &str {
            "energy_analyst"
        }
        fn description(&self) -> &str {
            "reports progress"
        }
        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn class(&self) -> ToolClass {
            ToolClass::Delegating
        }
        async fn execute(&self, _: serde_json::Value, ctx: &ToolContext) -> Result<ToolResult> {
            ctx.report(AgentEvent::tool_start("get_history"));
            tokio::time::sleep(Duration::from_millis(10)).await;
            ctx.report(AgentEvent::tool_end("get_history", "42 kWh"));
            Ok(ToolResult::text("Usage is normal"))
        }
    }

    fn dispatcher(tools: Vec<Arc<dyn Tool>>) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register_arc(tool);
        }
        ToolDispatcher::new(Arc::new(registry))
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_run_concurrently() {
        let d = dispatcher(vec![
            Arc::new(MockTool::new("get_entity_state").with_delay(Duration::from_secs(2))),
            Arc::new(MockTool::new("list_entities").with_delay(Duration::from_secs(2))),
        ]);
        let (tx, mut rx) = event_channel();

        let start = Instant::now();
        let results = d
            .dispatch(
                vec![call("1", "get_entity_state"), call("2", "list_entities")],
                &CallContext::new(),
                &tx,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(results.iter().all(|r| !r.is_error()));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], AgentEvent::ToolStart { .. }));
        assert!(matches!(events[3], AgentEvent::ToolEnd { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_error_result() {
        let slow = Arc::new(MockTool::new("get_history").with_delay(Duration::from_secs(60)));
        let fast = Arc::new(MockTool::new("get_entity_state").with_response(ToolResult::text("on")));
        let d = dispatcher(vec![slow, fast]).with_timeouts(DispatchTimeouts::new(
            Duration::from_secs(5),
            Duration::from_secs(120),
        ));
        let (tx, _rx) = event_channel();

        let results = d
            .dispatch(
                vec![call("1", "get_history"), call("2", "get_entity_state")],
                &CallContext::new(),
                &tx,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let timed_out = results.iter().find(|r| r.call_id == "1").unwrap();
        assert!(timed_out.output_text.contains("timed out"));
        assert!(timed_out.to_result_block().is_error);
        let ok = results.iter().find(|r| r.call_id == "2").unwrap();
        assert_eq!(ok.output_text, "on");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delegating_class_gets_longer_timeout() {
        let nested = Arc::new(
            MockTool::new("energy_analyst")
                .with_class(ToolClass::Delegating)
                .with_delay(Duration::from_secs(60)),
        );
        let d = dispatcher(vec![nested]);
        let (tx, _rx) = event_channel();

        let results = d
            .dispatch(vec![call("1", "energy_analyst")], &CallContext::new(), &tx)
            .await
            .unwrap();
        assert!(!results[0].is_error());
    }

    #[tokio::test]
    async fn test_failures_become_error_results() {
        let d = dispatcher(vec![Arc::new(PanickingTool), Arc::new(FailingTool)]);
        let (tx, _rx) = event_channel();

        let results = d
            .dispatch(
                vec![
                    call("1", "get_area_summary"),
                    call("2", "get_logbook"),
                    call("3", "not_registered"),
                ],
                &CallContext::new(),
                &tx,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_error()));
        let find = |id: &str| results.iter().find(|r| r.call_id == id).unwrap();
        assert!(find("1").output_text.contains("failed unexpectedly"));
        assert!(find("2").output_text.contains("logbook unavailable"));
        assert!(find("3").output_text.contains("Tool not found"));
    }

    #[tokio::test]
    async fn test_error_tool_result_is_marked() {
        let d = dispatcher(vec![Arc::new(
            MockTool::new("search_entities").with_response(ToolResult::error("no match")),
        )]);
        let (tx, _rx) = event_channel();
        let results = d
            .dispatch(vec![call("1", "search_entities")], &CallContext::new(), &tx)
            .await
            .unwrap();
        assert_eq!(results[0].error.as_deref(), Some("no match"));
        assert_eq!(results[0].output_text, "Error: no match");
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_relayed_between_start_and_end() {
        let d = dispatcher(vec![Arc::new(ReportingTool)]);
        let (tx, mut rx) = event_channel();

        d.dispatch(vec![call("1", "energy_analyst")], &CallContext::new(), &tx)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                AgentEvent::tool_start("energy_analyst"),
                AgentEvent::tool_start("get_history"),
                AgentEvent::tool_end("get_history", "42 kWh"),
                AgentEvent::tool_end("energy_analyst", "Usage is normal"),
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_channel_cancels_round() {
        let tool = Arc::new(MockTool::new("get_entity_state"));
        let d = dispatcher(vec![tool.clone()]);
        let (tx, rx) = event_channel();
        drop(rx);

        let err = d
            .dispatch(vec![call("1", "get_entity_state")], &CallContext::new(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(tool.call_count(), 0);
    }
}
