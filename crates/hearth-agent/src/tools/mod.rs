//! Built-in tools for the agent.
//!
//! Domain tools (entity state, history, control) live with whoever owns the
//! home-automation connection; this crate only ships sub-agent delegation.

mod delegate;

// Delegate tool
pub use delegate::DelegateTool;
