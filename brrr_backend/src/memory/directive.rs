//! Memory directives embedded in model output.
//!
//! The prompt asks the model to append a fenced block tagged `json` holding
//! `{"memories": [{"key": ..., "value": ..., "context": ...}]}`. Only the last
//! such block is honoured. Anything malformed is left in place and yields no
//! memories; this parser never fails.
//!
//! The fence tag is part of the prompt contract. Changing [`DIRECTIVE_FENCE`]
//! requires changing the memory instructions in the prompt at the same time.

use serde_json::Value;

use super::ProposedMemory;

pub const DIRECTIVE_FENCE: &str = "```json";
const FENCE_CLOSE: &str = "```";
const MEMORIES_FIELD: &str = "memories";

/// Visible text plus whatever memories the directive carried.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedDirective {
    pub visible: String,
    pub memories: Vec<ProposedMemory>,
}

pub fn extract_memories(content: &str) -> ExtractedDirective {
    let untouched = || ExtractedDirective {
        visible: content.to_string(),
        memories: Vec::new(),
    };

    if !content.contains(DIRECTIVE_FENCE) || !content.contains("\"memories\"") {
        return untouched();
    }

    let Some(start) = content.rfind(DIRECTIVE_FENCE) else {
        return untouched();
    };
    let body_start = start + DIRECTIVE_FENCE.len();
    // The directive's own closing fence; later code blocks are left alone
    let Some(rel_end) = content[body_start..].find(FENCE_CLOSE) else {
        return untouched();
    };
    let body_end = body_start + rel_end;

    let parsed: Value = match serde_json::from_str(content[body_start..body_end].trim()) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!("Ignoring malformed memory directive: {}", e);
            return untouched();
        }
    };
    let Some(items) = parsed.get(MEMORIES_FIELD).and_then(Value::as_array) else {
        return untouched();
    };

    let memories = items.iter().filter_map(proposed_from_value).collect();

    let before = content[..start].trim_end();
    let after = content[body_end + FENCE_CLOSE.len()..].trim_start();
    let visible = match (before.is_empty(), after.is_empty()) {
        (_, true) => before.to_string(),
        (true, false) => after.to_string(),
        (false, false) => format!("{}\n{}", before, after),
    };

    ExtractedDirective {
        visible: visible.trim().to_string(),
        memories,
    }
}

fn proposed_from_value(item: &Value) -> Option<ProposedMemory> {
    let obj = item.as_object()?;
    Some(ProposedMemory {
        key: obj.get("key").and_then(scalar_to_string),
        value: obj.get("value").and_then(scalar_to_string),
        context: obj.get("context").and_then(scalar_to_string),
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_directive_and_returns_memory() {
        let content = "Nice to meet you!\n```json\n{\"memories\":[{\"key\":\"name\",\"value\":\"Kyle\",\"context\":\"intro\"}]}\n```";
        let extracted = extract_memories(content);
        assert_eq!(extracted.visible, "Nice to meet you!");
        assert_eq!(extracted.memories.len(), 1);
        assert_eq!(extracted.memories[0].key.as_deref(), Some("name"));
        assert_eq!(extracted.memories[0].value.as_deref(), Some("Kyle"));
        assert_eq!(extracted.memories[0].context.as_deref(), Some("intro"));
    }

    #[test]
    fn malformed_directive_is_a_no_op() {
        let content = "Hello\n```json\n{\"memories\": [oops\n```";
        let extracted = extract_memories(content);
        assert_eq!(extracted.visible, content);
        assert!(extracted.memories.is_empty());
    }

    #[test]
    fn only_last_block_is_used() {
        let content = "Here is an example:\n```json\n{\"memories\": []}\n```\nAnd done.\n```json\n{\"memories\": [{\"key\": \"tz\", \"value\": \"UTC+2\"}]}\n```";
        let extracted = extract_memories(content);
        assert_eq!(extracted.memories.len(), 1);
        assert_eq!(extracted.memories[0].key.as_deref(), Some("tz"));
        assert!(extracted.visible.starts_with("Here is an example:"));
        assert!(extracted.visible.ends_with("And done."));
    }

    #[test]
    fn json_block_without_memories_array_is_kept() {
        let content = "Config:\n```json\n{\"theme\": \"dark\", \"memories\": \"none\"}\n```";
        let extracted = extract_memories(content);
        assert_eq!(extracted.visible, content);
        assert!(extracted.memories.is_empty());
    }

    #[test]
    fn text_after_the_block_survives() {
        let content = "Saved.\n```json\n{\"memories\": [{\"key\": \"lang\", \"value\": \"rust\"}]}\n```\nSee you!";
        let extracted = extract_memories(content);
        assert_eq!(extracted.visible, "Saved.\nSee you!");
    }

    #[test]
    fn code_block_after_the_directive_is_left_alone() {
        let content = "Here you go:\n```json\n{\"memories\":[{\"key\":\"lang\",\"value\":\"rust\"}]}\n```\nExample:\n```rust\nfn main() {}\n```";
        let extracted = extract_memories(content);
        assert_eq!(extracted.memories.len(), 1);
        assert_eq!(extracted.memories[0].value.as_deref(), Some("rust"));
        assert_eq!(
            extracted.visible,
            "Here you go:\nExample:\n```rust\nfn main() {}\n```"
        );
    }

    #[test]
    fn non_string_values_are_stringified() {
        let content = "```json\n{\"memories\": [{\"key\": \"years_coding\", \"value\": 5}, \"junk\"]}\n```";
        let extracted = extract_memories(content);
        assert_eq!(extracted.visible, "");
        assert_eq!(extracted.memories.len(), 1);
        assert_eq!(extracted.memories[0].value.as_deref(), Some("5"));
    }
}
