//! Conversation history: persisted user/assistant turns and the sanitizer
//! that turns them into grounding context.

pub mod sanitize;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sanitize::{sanitize_history, MAX_CONTEXT_TURNS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// Where a conversation happens: one user in one channel of one community.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationScope {
    pub user_id: i64,
    pub community_id: i64,
    pub channel_id: i64,
}

/// One stored turn. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: i64,
    pub scope: ConversationScope,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Selects turns to clear. Unset fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    pub user_id: Option<i64>,
    pub community_id: Option<i64>,
    pub channel_id: Option<i64>,
}

impl From<ConversationScope> for HistoryFilter {
    fn from(scope: ConversationScope) -> Self {
        Self {
            user_id: Some(scope.user_id),
            community_id: Some(scope.community_id),
            channel_id: Some(scope.channel_id),
        }
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append_turn(&self, scope: ConversationScope, role: Role, content: &str)
        -> Result<i64>;
    /// The latest `limit` turns for the scope, oldest first.
    async fn get_recent_turns(
        &self,
        scope: ConversationScope,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>>;
    /// Returns the number of turns removed.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
    /// Returns the number of turns removed.
    async fn clear_history(&self, filter: HistoryFilter) -> Result<usize>;
}
