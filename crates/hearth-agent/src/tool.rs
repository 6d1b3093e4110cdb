//! Tool framework.
//!
//! This module defines the [`Tool`] trait that all agent tools implement and
//! the [`ToolRegistry`] the dispatcher looks tools up in by name.
//!
//! # Example
//!
//! ```rust,ignore
//! use hearth_agent::{Tool, ToolContext, ToolResult, ToolRegistry};
//!
//! struct EntityStateTool;
//!
//! #[async_trait]
//! impl Tool for EntityStateTool {
//!     fn name(&self) -> &str { "get_entity_state" }
//!     fn description(&self) -> &str { "Read the current state of an entity" }
//!     fn parameters(&self) -> Value { json!({"type": "object"}) }
//!
//!     async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolResult> {
//!         Ok(ToolResult::text("on"))
//!     }
//! }
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(EntityStateTool);
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use hearth_llm::{CallContext, ToolDefinition};

use crate::error::{AgentError, Result};
use crate::event::{AgentEvent, EventSender};

// ─────────────────────────────────────────────────────────────────────────────
// Parameter Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Error type for tool parameter validation failures.
///
/// Messages are written for the model, so it can fix the call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParameterValidationError {
    /// A required parameter is missing.
    #[error("missing required parameter '{name}': {hint}")]
    MissingRequired {
        name: &'static str,
        hint: &'static str,
    },

    /// A parameter has an invalid type.
    #[error("invalid type for '{name}': expected {expected}, got {actual}")]
    InvalidType {
        name: &'static str,
        expected: &'static str,
        actual: String,
    },
}

impl ParameterValidationError {
    /// Create a missing required parameter error.
    pub fn missing(name: &'static str, hint: &'static str) -> Self {
        Self::MissingRequired { name, hint }
    }

    /// Create an invalid type error.
    pub fn invalid_type(
        name: &'static str,
        expected: &'static str,
        actual: impl Into<String>,
    ) -> Self {
        Self::InvalidType {
            name,
            expected,
            actual: actual.into(),
        }
    }
}

impl From<ParameterValidationError> for AgentError {
    fn from(err: ParameterValidationError) -> Self {
        AgentError::InvalidToolParams(err.to_string())
    }
}

/// Result type for parameter validation.
pub type ParamResult<T> = std::result::Result<T, ParameterValidationError>;

/// Helper trait for extracting parameters from JSON.
pub trait ParamExt {
    /// Get a required, non-empty string parameter.
    fn required_str(&self, name: &'static str, hint: &'static str) -> ParamResult<&str>;

    /// Get an optional string parameter.
    fn optional_str(&self, name: &str) -> Option<&str>;
}

impl ParamExt for serde_json::Value {
    fn required_str(&self, name: &'static str, hint: &'static str) -> ParamResult<&str> {
        match self.get(name) {
            None | Some(serde_json::Value::Null) => {
                Err(ParameterValidationError::missing(name, hint))
            }
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
                Err(ParameterValidationError::missing(name, hint))
            }
            Some(serde_json::Value::String(s)) => Ok(s),
            Some(other) => Err(ParameterValidationError::invalid_type(
                name,
                "string",
                json_type_name(other),
            )),
        }
    }

    fn optional_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Timeout class of a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    /// Ordinary query or action.
    #[default]
    Standard,
    /// Runs a nested agent and needs the longer timeout.
    Delegating,
}

/// Trait for agent tools.
///
/// Each tool defines its parameters as a JSON Schema and implements async
/// execution. Failures may be returned either as `Err` or as
/// [`ToolResult::Error`]; the dispatcher feeds both back to the model as text.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the unique name of this tool.
    fn name(&self) -> &str;

    /// Get a human-readable description of what this tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for this tool's parameters.
    fn parameters(&self) -> serde_json::Value;

    /// Timeout class. Defaults to [`ToolClass::Standard`].
    fn class(&self) -> ToolClass {
        ToolClass::Standard
    }

    /// Execute the tool with the given parameters.
    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolResult>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context provided to tools during execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Conversation and agent role this call belongs to.
    pub call: CallContext,
    /// ID of the tool call being executed.
    pub call_id: String,
    /// Cancelled when the call times out.
    pub cancellation: CancellationToken,
    /// Channel for progress notifications, if anyone is listening.
    pub progress: Option<EventSender>,
}

impl ToolContext {
    /// Create a new tool context.
    pub fn new(call: CallContext, call_id: impl Into<String>) -> Self {
        Self {
            call,
            call_id: call_id.into(),
            cancellation: CancellationToken::new(),
            progress: None,
        }
    }

    /// Attach a progress channel.
    pub fn with_progress(mut self, sender: EventSender) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Use the given cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Check if execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Publish a progress notification. Silently does nothing without a
    /// channel or once the listener has gone away.
    pub fn report(&self, event: AgentEvent) {
        if let Some(ref sender) = self.progress {
            let _ = sender.send(event);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Result
// ─────────────────────────────────────────────────────────────────────────────

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResult {
    /// Successful text output.
    Text { content: String },
    /// Tool execution failed.
    Error { message: String },
}

impl ToolResult {
    /// Create a text result.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Create an error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Check if this result is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Get the content as a string for LLM consumption.
    pub fn to_llm_content(&self) -> String {
        match self {
            Self::Text { content } => content.clone(),
            Self::Error { message } => format!("Error: {}", message),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Name-keyed collection of tools.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Check if a tool is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions to bind to a completion request, sorted by name.
    pub fn to_llm_definitions(&self) -> Vec<ToolDefinition> {
        self.names()
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters()))
            .collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock Tool
// ─────────────────────────────────────────────────────────────────────────────

/// A mock tool for testing.
///
/// Returns a configurable response after an optional delay and records the
/// parameters of every call.
#[derive(Debug)]
pub struct MockTool {
    name: String,
    description: String,
    class: ToolClass,
    delay: Option<Duration>,
    response: parking_lot::Mutex<Option<ToolResult>>,
    calls: parking_lot::Mutex<Vec<serde_json::Value>>,
}

impl MockTool {
    /// Create a new mock tool.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: "A mock tool for testing".to_string(),
            class: ToolClass::Standard,
            delay: None,
            response: parking_lot::Mutex::new(None),
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Set the response to return.
    pub fn with_response(self, response: ToolResult) -> Self {
        *self.response.lock() = Some(response);
        self
    }

    /// Sleep before responding.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set the timeout class.
    pub fn with_class(mut self, class: ToolClass) -> Self {
        self.class = class;
        self
    }

    /// Get the calls that were made to this tool.
    pub fn calls(&self) -> Vec<serde_json::Value> {
        self.calls.lock().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    fn class(&self) -> ToolClass {
        self.class
    }

    async fn execute(&self, params: serde_json::Value, _ctx: &ToolContext) -> Result<ToolResult> {
        self.calls.lock().push(params);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        Ok(self
            .response
            .lock()
            .clone()
            .unwrap_or_else(|| ToolResult::text("mock response")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_result_llm_content() {
        assert_eq!(ToolResult::text("on").to_llm_content(), "on");
        assert_eq!(
            ToolResult::error("entity not found").to_llm_content(),
            "Error: entity not found"
        );
    }

    #[test]
    fn test_registry_definitions_are_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("list_entities"));
        registry.register(MockTool::new("get_entity_state"));

        let defs = registry.to_llm_definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "get_entity_state");
        assert_eq!(registry.names(), vec!["get_entity_state", "list_entities"]);
    }

    #[tokio::test]
    async fn test_mock_tool_records_calls() {
        let tool = MockTool::new("get_entity_state").with_response(ToolResult::text("off"));
        let result = tool
            .execute(json!({"entity_id": "light.porch"}), &ToolContext::default())
            .await
            .unwrap();

        assert_eq!(result, ToolResult::text("off"));
        assert_eq!(tool.call_count(), 1);
        assert_eq!(tool.calls()[0]["entity_id"], "light.porch");
    }

    #[test]
    fn test_report_without_channel_is_noop() {
        let ctx = ToolContext::default();
        ctx.report(AgentEvent::tool_start("nested"));
    }

    #[test]
    fn test_report_after_receiver_dropped_is_noop() {
        let (tx, rx) = crate::event::event_channel();
        drop(rx);
        let ctx = ToolContext::default().with_progress(tx);
        ctx.report(AgentEvent::tool_start("nested"));
    }

    #[test]
    fn test_required_str() {
        let params = json!({"task": "check lights", "empty": " ", "n": 3});
        assert_eq!(params.required_str("task", "describe the task").unwrap(), "check lights");
        assert!(matches!(
            params.required_str("missing", "hint"),
            Err(ParameterValidationError::MissingRequired { .. })
        ));
        assert!(params.required_str("empty", "hint").is_err());
        assert!(matches!(
            params.required_str("n", "hint"),
            Err(ParameterValidationError::InvalidType { actual, .. }) if actual == "number"
        ));
    }
}
