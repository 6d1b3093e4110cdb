//! Resilient LLM invocation for Hearth.
//!
//! Providers implement [`LlmBackend`]. A [`ResilientInvoker`] puts a primary
//! backend (and an optional fallback) behind per-provider circuit breakers,
//! retry with backoff, and fire-and-forget usage reporting.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  ResilientInvoker                            │
//! │  - invoke()        -> CompletionResponse     │
//! │  - invoke_stream() -> Stream<StreamEvent>    │
//! └──────────────────────────────────────────────┘
//!        │ retry + breaker        │ one attempt + breaker
//!        ▼                        ▼
//!   ┌─────────┐             ┌──────────┐
//!   │ primary │             │ fallback │      BreakerRegistry (shared)
//!   └─────────┘             └──────────┘      UsageSink (spawned)
//! ```

pub mod backend;
pub mod breaker;
pub mod context;
pub mod error;
pub mod invoker;
pub mod openai;
pub mod types;
pub mod usage;

pub use backend::{
    LlmBackend, MockBackend, MockReply, ResponseStream, SharedBackend, StreamEvent,
    ToolCallFragment, response_events, text_response,
};
pub use breaker::{
    BreakerConfig, BreakerRegistry, CircuitBreaker, Clock, ManualClock, ProviderState, SystemClock,
};
pub use context::CallContext;
pub use error::{LlmError, Result};
pub use invoker::{ResilientInvoker, RetryPolicy};
pub use openai::{OpenAiBackend, OpenAiConfig};
pub use types::{
    CompletionRequest, CompletionResponse, Content, ContentBlock, Message, Role, StopReason,
    ToolDefinition, ToolResultBlock, Usage,
};
pub use usage::{
    ActivityEvent, MemoryUsageSink, ModelPricing, PricingTable, SinkError, TracingUsageSink,
    UsageRecord, UsageSink,
};
