//! Conversation loop for Hearth.
//!
//! This crate drives multi-round, tool-calling conversations on top of
//! [`hearth_llm::ResilientInvoker`]. Model output is streamed, split into
//! visible text and internal reasoning, and scanned for tool calls. Read-only
//! calls run concurrently; any state-changing call stops the turn until a
//! human approves it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ConversationOrchestrator                                   │
//! │  - Streams each round, bounded by max_tool_iterations       │
//! │  - Folds tool results back into history                     │
//! │  - Emits AgentEvents on a channel                           │
//! └─────────────────────────────────────────────────────────────┘
//!          │              │               │              │
//!          ▼              ▼               ▼              ▼
//!   ┌───────────┐  ┌─────────────┐  ┌────────────┐  ┌──────────────┐
//!   │ TagFilter │  │ToolCall     │  │MutationGate│  │ToolDispatcher│
//!   │           │  │Assembler    │  │            │  │ (ToolRegistry)│
//!   └───────────┘  └─────────────┘  └────────────┘  └──────────────┘
//! ```
//!
//! # Core Components
//!
//! - [`ConversationOrchestrator`]: the bounded round loop
//! - [`AgentEvent`]: the outward event vocabulary
//! - [`Tool`] / [`ToolRegistry`]: the capability interface tools implement
//! - [`DelegateTool`]: runs a nested orchestrator as a tool

pub mod assembler;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod gate;
pub mod orchestrator;
pub mod tag_filter;
pub mod tool;
pub mod tools;
pub mod types;

// Re-export core types
pub use error::{AgentError, Result};
pub use types::{AgentConfig, ConversationId, DEFAULT_FALLBACK_ANSWER, DEFAULT_MAX_TOOL_ITERATIONS};

// Re-export event types
pub use event::{
    AgentEvent, AgentStream, EventReceiver, EventSender, RESULT_SUMMARY_CHARS, event_channel,
    into_stream,
};

// Re-export tool types
pub use tool::{
    MockTool, ParamExt, ParamResult, ParameterValidationError, Tool, ToolClass, ToolContext,
    ToolRegistry, ToolResult,
};

// Re-export round pipeline
pub use assembler::{ToolCallAssembler, ToolCallRequest};
pub use dispatcher::{
    DEFAULT_DELEGATE_TIMEOUT, DEFAULT_TOOL_TIMEOUT, DispatchTimeouts, ToolDispatcher,
    ToolExecutionResult,
};
pub use gate::{ApprovalRequest, DEFAULT_READ_ONLY_TOOLS, GateDecision, MutationGate};
pub use tag_filter::{StreamToken, TagFilter, default_markers};

// Re-export orchestrator
pub use orchestrator::{ConversationOrchestrator, TurnOutcome, TurnResult};

// Re-export built-in tools
pub use tools::DelegateTool;
