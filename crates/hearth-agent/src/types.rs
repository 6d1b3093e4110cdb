//! Core types for the agent crate.
//!
//! - [`ConversationId`]: identifies one conversation across turns
//! - [`AgentConfig`]: runtime configuration for a conversation orchestrator

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hearth_llm::CallContext;

/// Default cap on model rounds per conversation turn.
pub const DEFAULT_MAX_TOOL_ITERATIONS: u32 = 10;

/// Answer used when a turn ends without any visible text.
pub const DEFAULT_FALLBACK_ANSWER: &str = "Done. I have nothing further to add.";

// ─────────────────────────────────────────────────────────────────────────────
// ID Types
// ─────────────────────────────────────────────────────────────────────────────

/// Unique identifier for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(Uuid);

impl ConversationId {
    /// Create a new random conversation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Call context for an agent role in this conversation.
    pub fn call_context(&self, role: impl Into<String>) -> CallContext {
        CallContext::new()
            .with_conversation(self.to_string())
            .with_role(role)
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent Config
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime configuration for a [`ConversationOrchestrator`](crate::ConversationOrchestrator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model requested from the invoker. Pinned backends may override it.
    pub model: String,
    /// Maximum tokens per model response.
    pub max_tokens: u32,
    /// System prompt.
    pub system_prompt: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Hard cap on model rounds per turn.
    pub max_tool_iterations: u32,
    /// Opening/closing marker pairs that delimit internal reasoning.
    pub reasoning_markers: Vec<(String, String)>,
    /// Answer used when a turn produced no visible text.
    pub fallback_answer: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 4096,
            system_prompt: None,
            temperature: None,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            reasoning_markers: crate::tag_filter::default_markers(),
            fallback_answer: DEFAULT_FALLBACK_ANSWER.to_string(),
        }
    }
}

impl AgentConfig {
    /// Create a config for the given model.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set max tokens.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the round cap.
    pub fn with_max_tool_iterations(mut self, max: u32) -> Self {
        self.max_tool_iterations = max.max(1);
        self
    }

    /// Replace the reasoning markers.
    pub fn with_reasoning_markers(mut self, markers: Vec<(String, String)>) -> Self {
        self.reasoning_markers = markers;
        self
    }

    /// Set the answer used when nothing visible was produced.
    pub fn with_fallback_answer(mut self, answer: impl Into<String>) -> Self {
        self.fallback_answer = answer.into();
        self
    }
}
