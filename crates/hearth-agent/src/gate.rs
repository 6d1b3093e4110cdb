//! Approval gating for state-changing tool calls.
//!
//! The gate knows only which tools are read-only. Any tool it has not been
//! told about is treated as mutating, and a single mutating call holds back
//! the whole round.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::assembler::ToolCallRequest;

/// Tools that only read home state.
pub const DEFAULT_READ_ONLY_TOOLS: &[&str] = &[
    "get_entity_state",
    "list_entities",
    "search_entities",
    "get_history",
    "get_logbook",
    "get_area_summary",
];

/// Raised when a round contains at least one mutating call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Human-readable summary of every call in the round.
    pub description: String,
    /// JSON array of the withheld calls, for whoever applies the decision.
    pub serialized_actions: String,
}

/// Outcome of gating one round.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Every call is read-only and may run.
    Proceed(Vec<ToolCallRequest>),
    /// Nothing runs until the request is decided.
    Halt(ApprovalRequest),
}

#[derive(Serialize)]
struct SerializedAction<'a> {
    id: &'a str,
    name: &'a str,
    args: &'a serde_json::Value,
    mutating: bool,
}

/// Read-only allow-list.
#[derive(Debug, Clone)]
pub struct MutationGate {
    read_only: HashSet<String>,
}

impl Default for MutationGate {
    fn default() -> Self {
        Self::new(DEFAULT_READ_ONLY_TOOLS.iter().copied())
    }
}

impl MutationGate {
    pub fn new<I, S>(read_only: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            read_only: read_only.into_iter().map(Into::into).collect(),
        }
    }

    /// Add a tool to the allow-list.
    pub fn allow(mut self, name: impl Into<String>) -> Self {
        self.read_only.insert(name.into());
        self
    }

    pub fn is_read_only(&self, name: &str) -> bool {
        self.read_only.contains(name)
    }

    /// Gate a round of calls.
    pub fn evaluate(&self, calls: Vec<ToolCallRequest>) -> GateDecision {
        let mutating = calls.iter().filter(|c| !self.is_read_only(&c.name)).count();
        if mutating == 0 {
            return GateDecision::Proceed(calls);
        }

        let mut description = format!(
            "{} of {} requested action(s) would change home state and need approval:",
            mutating,
            calls.len()
        );
        for call in &calls {
            let kind = if self.is_read_only(&call.name) {
                "read-only, withheld"
            } else {
                "mutating"
            };
            description.push_str(&format!("\n- {} {} ({})", call.name, call.args, kind));
        }

        let actions: Vec<SerializedAction<'_>> = calls
            .iter()
            .map(|c| SerializedAction {
                id: &c.id,
                name: &c.name,
                args: &c.args,
                mutating: !self.is_read_only(&c.name),
            })
            .collect();
        let serialized_actions =
            serde_json::to_string(&actions).unwrap_or_else(|_| "[]".to_string());

        tracing::info!(
            mutating,
            total = calls.len(),
            "Round halted for approval"
        );

        GateDecision::Halt(ApprovalRequest {
            description,
            serialized_actions,
        })
    }
}
