//! Reassembly of streamed tool-call fragments.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hearth_llm::{ContentBlock, ToolCallFragment};

/// A complete tool call, ready for gating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Parsed arguments. Always a JSON object.
    pub args: Value,
    /// Concatenated argument text as the model produced it.
    pub raw_args_text: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        let raw_args_text = args.to_string();
        Self {
            id: id.into(),
            name: name.into(),
            args,
            raw_args_text,
        }
    }

    /// The assistant-side history block for this call.
    pub fn to_content_block(&self) -> ContentBlock {
        ContentBlock::tool_use(&self.id, &self.name, self.args.clone())
    }
}

/// Buffers fragments per call id for one model round.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    buffers: HashMap<String, Vec<ToolCallFragment>>,
    order: Vec<String>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a fragment. Fragments may arrive in any order.
    pub fn push(&mut self, fragment: ToolCallFragment) {
        let buffer = self.buffers.entry(fragment.call_id.clone()).or_insert_with(|| {
            self.order.push(fragment.call_id.clone());
            Vec::new()
        });
        buffer.push(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of distinct calls seen so far.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Finalize every buffered call, dropping malformed ones.
    ///
    /// Calls come back in the order their first fragment arrived.
    pub fn finish(self) -> Vec<ToolCallRequest> {
        let Self { mut buffers, order } = self;
        order
            .into_iter()
            .filter_map(|id| {
                let fragments = buffers.remove(&id)?;
                assemble(id, fragments)
            })
            .collect()
    }
}

fn assemble(id: String, mut fragments: Vec<ToolCallFragment>) -> Option<ToolCallRequest> {
    fragments.sort_by_key(|f| f.sequence_index);

    let mut name = String::new();
    let mut raw_args_text = String::new();
    for fragment in &fragments {
        name.push_str(&fragment.name_part);
        raw_args_text.push_str(&fragment.args_part);
    }

    let name = name.trim().to_string();
    if name.is_empty() {
        tracing::debug!(call_id = %id, "Dropping tool call with empty name");
        return None;
    }

    let args = if raw_args_text.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_str::<Value>(&raw_args_text) {
            Ok(value @ Value::Object(_)) => value,
            Ok(other) => {
                tracing::debug!(
                    call_id = %id,
                    tool = %name,
                    args = %other,
                    "Dropping tool call with non-object arguments"
                );
                return None;
            }
            Err(e) => {
                tracing::debug!(
                    call_id = %id,
                    tool = %name,
                    error = %e,
                    raw = %raw_args_text,
                    "Dropping tool call with unparsable arguments"
                );
                return None;
            }
        }
    };

    Some(ToolCallRequest {
        id,
        name,
        args,
        raw_args_text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frag(id: &str, seq: usize, name: &str, args: &str) -> ToolCallFragment {
        ToolCallFragment::new(id, seq, name, args)
    }

    #[test]
    fn test_merges_interleaved_calls() {
        let mut asm = ToolCallAssembler::new();
        asm.push(frag("a", 0, "get_entity_", ""));
        asm.push(frag("b", 0, "list_entities", "{}"));
        asm.push(frag("a", 1, "state", "{\"entity_id\":"));
        asm.push(frag("a", 2, "", "\"light.porch\"}"));

        let calls = asm.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[0].name, "get_entity_state");
        assert_eq!(calls[0].args, json!({"entity_id": "light.porch"}));
        assert_eq!(calls[0].raw_args_text, "{\"entity_id\":\"light.porch\"}");
        assert_eq!(calls[1].name, "list_entities");
    }

    #[test]
    fn test_empty_args_become_empty_object() {
        let mut asm = ToolCallAssembler::new();
        asm.push(frag("a", 0, "list_entities", "  "));
        let calls = asm.finish();
        assert_eq!(calls[0].args, json!({}));
    }

    #[test]
    fn test_malformed_calls_are_dropped() {
        let mut asm = ToolCallAssembler::new();
        asm.push(frag("no_name", 0, "", "{}"));
        asm.push(frag("bad_json", 0, "control_entity", "{\"entity_id\": "));
        asm.push(frag("array", 0, "control_entity", "[1, 2]"));
        asm.push(frag("ok", 0, "get_history", "{}"));

        let calls = asm.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "ok");
    }

    #[test]
    fn test_to_content_block() {
        let call = ToolCallRequest::new("c1", "get_entity_state", json!({"entity_id": "sun.sun"}));
        assert_eq!(
            call.to_content_block(),
            ContentBlock::tool_use("c1", "get_entity_state", json!({"entity_id": "sun.sun"}))
        );
    }
}
