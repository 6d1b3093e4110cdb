//! Call-scoped context threaded through every invocation.

use serde::{Deserialize, Serialize};

/// Who is calling the model, for usage attribution.
///
/// The invoker only reads this; backends and tools never need it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    /// Conversation the call belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Role of the agent making the call (e.g. "assistant", "energy-analyst").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_role: Option<String>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.agent_role = Some(role.into());
        self
    }

    /// Same conversation, different agent role. Used for nested agents.
    pub fn for_role(&self, role: impl Into<String>) -> Self {
        Self {
            conversation_id: self.conversation_id.clone(),
            agent_role: Some(role.into()),
        }
    }
}
