//! Community project board: weekly projects, their checklists, and the idea pool.
//!
//! These are plain data-access records. The only consumer inside the turn engine
//! is the tool catalog, which reaches them through [`ProjectStore`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Archived,
    Completed,
}

impl ProjectStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Archived => "archived",
            ProjectStatus::Completed => "completed",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "archived" => ProjectStatus::Archived,
            "completed" => ProjectStatus::Completed,
            _ => ProjectStatus::Active,
        }
    }

    /// Strict parse for user/model supplied filters.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => Some(ProjectStatus::Active),
            "archived" => Some(ProjectStatus::Archived),
            "completed" => Some(ProjectStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub community_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub owners: Vec<i64>,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub label: String,
    pub is_done: bool,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Idea {
    pub id: i64,
    pub community_id: i64,
    pub author_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub used_project_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Storage contract for the project board.
///
/// Lookups by id are not community-scoped; callers compare `community_id`
/// themselves so a foreign record can be reported as missing.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create_project(
        &self,
        community_id: i64,
        title: &str,
        description: Option<&str>,
        owners: &[i64],
    ) -> Result<i64>;
    async fn get_project(&self, project_id: i64) -> Result<Option<Project>>;
    async fn list_projects(
        &self,
        community_id: i64,
        status: Option<ProjectStatus>,
    ) -> Result<Vec<Project>>;
    async fn archive_project(&self, project_id: i64) -> Result<()>;
    async fn complete_project(&self, project_id: i64) -> Result<()>;

    async fn create_task(&self, project_id: i64, label: &str, created_by: Option<i64>)
        -> Result<i64>;
    async fn get_task(&self, task_id: i64) -> Result<Option<Task>>;
    async fn list_tasks(&self, project_id: i64) -> Result<Vec<Task>>;
    /// Flip completion and return the new state.
    async fn toggle_task(&self, task_id: i64) -> Result<bool>;
    async fn delete_task(&self, task_id: i64) -> Result<()>;

    async fn create_idea(
        &self,
        community_id: i64,
        author_id: i64,
        title: &str,
        description: Option<&str>,
    ) -> Result<i64>;
    async fn get_idea(&self, idea_id: i64) -> Result<Option<Idea>>;
    async fn list_ideas(&self, community_id: i64, unused_only: bool) -> Result<Vec<Idea>>;
    /// Record that `project_id` was started from this idea.
    async fn mark_idea_used(&self, idea_id: i64, project_id: i64) -> Result<()>;
    async fn delete_idea(&self, idea_id: i64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_is_strict_but_db_read_is_lenient() {
        assert_eq!(ProjectStatus::parse(" Active "), Some(ProjectStatus::Active));
        assert_eq!(ProjectStatus::parse("shipped"), None);
        assert_eq!(ProjectStatus::from_db("shipped"), ProjectStatus::Active);
        assert_eq!(ProjectStatus::from_db("archived"), ProjectStatus::Archived);
    }
}
