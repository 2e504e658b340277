pub mod directive;
pub mod persona;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved memory key holding a user's custom response instructions.
///
/// It is read by the prompt builder as persona text and never listed as a
/// regular memory.
pub const PERSONA_MEMORY_KEY: &str = "persona_instructions";

/// Key used when the model proposes a memory without naming one.
pub const DEFAULT_MEMORY_KEY: &str = "misc";

/// A durable fact about one user inside one community.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: String,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn is_persona(&self) -> bool {
        self.key == PERSONA_MEMORY_KEY
    }
}

/// A memory the model asked us to save. Every field is optional because the
/// model does not always follow the directive format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposedMemory {
    pub key: Option<String>,
    pub value: Option<String>,
    pub context: Option<String>,
}

impl ProposedMemory {
    /// Key to write under; blank keys fall back to [`DEFAULT_MEMORY_KEY`].
    pub fn key_or_default(&self) -> &str {
        match self.key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key,
            _ => DEFAULT_MEMORY_KEY,
        }
    }

    pub fn value_or_default(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }
}

/// Per-(user, community) key/value facts. Writes are upserts: one row per key,
/// last write wins.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn set_memory(
        &self,
        user_id: i64,
        community_id: i64,
        key: &str,
        value: &str,
        context: Option<&str>,
    ) -> Result<()>;
    async fn get_memory(
        &self,
        user_id: i64,
        community_id: i64,
        key: &str,
    ) -> Result<Option<MemoryEntry>>;
    /// All memories for the user in creation order, persona entry included.
    async fn get_all_memories(&self, user_id: i64, community_id: i64) -> Result<Vec<MemoryEntry>>;
    /// Returns whether a row was removed.
    async fn delete_memory(&self, user_id: i64, community_id: i64, key: &str) -> Result<bool>;
    /// Returns how many rows were removed.
    async fn clear_all_for_user(&self, user_id: i64, community_id: i64) -> Result<usize>;
}

/// Pull the persona instructions out of a memory listing, if any are set.
pub fn persona_instructions(memories: &[MemoryEntry]) -> Option<&str> {
    memories
        .iter()
        .find(|entry| entry.is_persona())
        .map(|entry| entry.value.trim())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str) -> MemoryEntry {
        MemoryEntry {
            key: key.to_string(),
            value: value.to_string(),
            context: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn persona_instructions_found_among_memories() {
        let memories = vec![
            entry("skill_python", "advanced"),
            entry(PERSONA_MEMORY_KEY, "  Be concise.  "),
        ];
        assert_eq!(persona_instructions(&memories), Some("Be concise."));
        assert_eq!(persona_instructions(&memories[..1]), None);
    }

    #[test]
    fn blank_persona_counts_as_unset() {
        let memories = vec![entry(PERSONA_MEMORY_KEY, "   ")];
        assert_eq!(persona_instructions(&memories), None);
    }

    #[test]
    fn proposed_memory_defaults_fill_missing_fields() {
        let proposed = ProposedMemory {
            key: Some("  ".to_string()),
            value: None,
            context: None,
        };
        assert_eq!(proposed.key_or_default(), DEFAULT_MEMORY_KEY);
        assert_eq!(proposed.value_or_default(), "");
    }
}
