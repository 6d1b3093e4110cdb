//! Delegate tool for sub-agent invocation.
//!
//! Lets the main agent hand a task to a specialised sub-agent with its own
//! role, prompt and tool set. The sub-agent runs a full nested turn; its tool
//! lifecycle is relayed to the parent as progress events.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use hearth_llm::Message;

use crate::error::Result;
use crate::event::{AgentEvent, event_channel};
use crate::orchestrator::{ConversationOrchestrator, TurnOutcome};
use crate::tool::{ParamExt, Tool, ToolClass, ToolContext, ToolResult};

// ─────────────────────────────────────────────────────────────────────────────
// Delegate Tool
// ─────────────────────────────────────────────────────────────────────────────

/// Tool that runs a nested [`ConversationOrchestrator`].
///
/// The tool name doubles as the sub-agent's role for usage attribution. The
/// sub-agent applies its own approval gate: if it wants to change state, the
/// delegation fails and nothing runs.
///
/// # Example Usage
///
/// ```json
/// {
///   "task": "Compare this week's energy use with last week",
///   "context": "The user mentioned the heat pump was serviced on Monday"
/// }
/// ```
pub struct DelegateTool {
    name: String,
    description: String,
    agent: Arc<ConversationOrchestrator>,
}

impl std::fmt::Debug for DelegateTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateTool")
            .field("name", &self.name)
            .field("tools", &self.agent.registry().names())
            .finish()
    }
}

impl DelegateTool {
    /// Create a delegate tool for a sub-agent.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        agent: Arc<ConversationOrchestrator>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            agent,
        }
    }

    fn prompt(task: &str, context: Option<&str>) -> String {
        match context {
            Some(context) if !context.trim().is_empty() => {
                format!("{}\n\nContext:\n{}", task, context)
            }
            _ => task.to_string(),
        }
    }

    /// Forward nested tool lifecycle; the sub-agent's own text stays private.
    fn relay(ctx: &ToolContext, event: AgentEvent) {
        if matches!(event, AgentEvent::ToolStart { .. } | AgentEvent::ToolEnd { .. }) {
            ctx.report(event);
        }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Task description for the sub-agent to execute"
                },
                "context": {
                    "type": "string",
                    "description": "Additional context from the current conversation to pass to the sub-agent"
                }
            },
            "required": ["task"]
        })
    }

    fn class(&self) -> ToolClass {
        ToolClass::Delegating
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolResult> {
        if ctx.is_cancelled() {
            return Ok(ToolResult::error("Operation cancelled"));
        }

        let task = params.required_str("task", "describe what the sub-agent should do")?;
        let prompt = Self::prompt(task, params.optional_str("context"));
        let call = ctx.call.for_role(&self.name);

        tracing::info!(agent = %self.name, call_id = %ctx.call_id, "Delegating task");

        let (tx, mut rx) = event_channel();
        let run = self.agent.run(vec![Message::user(prompt)], &call, &tx);
        tokio::pin!(run);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(event) = rx.recv() => Self::relay(ctx, event),
                result = &mut run => break result,
            }
        };
        while let Ok(event) = rx.try_recv() {
            Self::relay(ctx, event);
        }

        match outcome {
            Ok(turn) => match turn.outcome {
                TurnOutcome::Answer { text, truncated } => {
                    tracing::info!(agent = %self.name, iterations = turn.iterations, truncated, "Delegation completed");
                    Ok(ToolResult::text(text))
                }
                TurnOutcome::AwaitingApproval(request) => {
                    tracing::info!(agent = %self.name, "Delegation halted for approval");
                    Ok(ToolResult::error(format!(
                        "Sub-agent '{}' wanted to change home state; nothing was executed.\n{}",
                        self.name, request.description
                    )))
                }
            },
            Err(e) => Ok(ToolResult::error(format!(
                "Sub-agent '{}' failed: {}",
                self.name, e
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
