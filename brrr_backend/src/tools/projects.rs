//! Project board tools: list, create, inspect and archive projects.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{arg_i64, arg_str, Tool, ToolCategory, ToolContext, ToolOutput};
use crate::domain::{Project, ProjectStatus, ProjectStore, Task};

pub(crate) fn project_not_found(project_id: i64) -> ToolOutput {
    ToolOutput::error(format!("Project with ID {} not found.", project_id))
}

/// Load a project, treating one from another community as missing.
pub(crate) async fn load_project(
    store: &dyn ProjectStore,
    project_id: i64,
    ctx: &ToolContext,
) -> Result<Option<Project>> {
    Ok(store
        .get_project(project_id)
        .await?
        .filter(|project| project.community_id == ctx.community_id))
}

pub(crate) fn render_task_line(task: &Task) -> String {
    let mark = if task.is_done { "[x]" } else { "[ ]" };
    format!("  {} [{}] {}", mark, task.id, task.label)
}

// ============================================================================
// get_projects
// ============================================================================

pub struct GetProjectsTool {
    store: Arc<dyn ProjectStore>,
}

impl GetProjectsTool {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for GetProjectsTool {
    fn name(&self) -> &str {
        "get_projects"
    }

    fn description(&self) -> &str {
        "Get a list of projects for the current community, optionally filtered by status."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["active", "archived", "completed"],
                    "description": "Filter projects by status (e.g., 'active')"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let status = match arg_str(&params, "status") {
            Some(raw) => match ProjectStatus::parse(raw) {
                Some(status) => Some(status),
                None => {
                    return Ok(ToolOutput::error(format!(
                        "Unknown status '{}'. Use active, archived or completed.",
                        raw
                    )))
                }
            },
            None => None,
        };

        let projects = self.store.list_projects(ctx.community_id, status).await?;
        if projects.is_empty() {
            return Ok(ToolOutput::Text("No projects found.".to_string()));
        }

        let lines: Vec<String> = projects
            .iter()
            .map(|p| {
                format!(
                    "ID: {} | Title: {} | Status: {}",
                    p.id,
                    p.title,
                    p.status.as_db_str()
                )
            })
            .collect();
        Ok(ToolOutput::Text(lines.join("\n")))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Projects
    }
}

// ============================================================================
// create_project
// ============================================================================

pub struct CreateProjectTool {
    store: Arc<dyn ProjectStore>,
}

impl CreateProjectTool {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for CreateProjectTool {
    fn name(&self) -> &str {
        "create_project"
    }

    fn description(&self) -> &str {
        "Create a new project for the community. Use this when a user wants to start a new project."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "The title/name of the project"
                },
                "description": {
                    "type": "string",
                    "description": "A description of what the project is about"
                }
            },
            "required": ["title"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(title) = arg_str(&params, "title") else {
            return Ok(ToolOutput::error("Missing required argument 'title'"));
        };
        let description = arg_str(&params, "description");

        let project_id = self
            .store
            .create_project(ctx.community_id, title, description, &[ctx.user_id])
            .await?;

        Ok(ToolOutput::Text(format!(
            "Project '{}' created successfully! ID: {}. You can now add tasks to this project using create_task with project_id={}.",
            title, project_id, project_id
        )))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Projects
    }
}

// ============================================================================
// get_project_info
// ============================================================================

pub struct GetProjectInfoTool {
    store: Arc<dyn ProjectStore>,
}

impl GetProjectInfoTool {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for GetProjectInfoTool {
    fn name(&self) -> &str {
        "get_project_info"
    }

    fn description(&self) -> &str {
        "Get detailed information about a specific project, including its tasks."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "project_id": {
                    "type": "integer",
                    "description": "The ID of the project to get info for"
                }
            },
            "required": ["project_id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(project_id) = arg_i64(&params, "project_id") else {
            return Ok(ToolOutput::error("project_id must be an integer"));
        };
        let Some(project) = load_project(self.store.as_ref(), project_id, ctx).await? else {
            return Ok(project_not_found(project_id));
        };

        let tasks = self.store.list_tasks(project_id).await?;
        let completed = tasks.iter().filter(|t| t.is_done).count();

        let mut lines = vec![
            format!("**{}** (ID: {})", project.title, project.id),
            format!("Status: {}", project.status.as_db_str()),
            format!(
                "Description: {}",
                project.description.as_deref().unwrap_or("No description")
            ),
            format!("Created: {}", project.created_at.format("%Y-%m-%d %H:%M UTC")),
            format!("Tasks: {}/{} completed", completed, tasks.len()),
        ];
        if !tasks.is_empty() {
            lines.push(String::new());
            lines.push("Task List:".to_string());
            lines.extend(tasks.iter().map(render_task_line));
        }
        Ok(ToolOutput::Text(lines.join("\n")))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Projects
    }
}

// ============================================================================
// archive_project
// ============================================================================

pub struct ArchiveProjectTool {
    store: Arc<dyn ProjectStore>,
}

impl ArchiveProjectTool {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ArchiveProjectTool {
    fn name(&self) -> &str {
        "archive_project"
    }

    fn description(&self) -> &str {
        "Archive a project (mark it as no longer active)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "project_id": {
                    "type": "integer",
                    "description": "The ID of the project to archive"
                }
            },
            "required": ["project_id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(project_id) = arg_i64(&params, "project_id") else {
            return Ok(ToolOutput::error("project_id must be an integer"));
        };
        let Some(project) = load_project(self.store.as_ref(), project_id, ctx).await? else {
            return Ok(project_not_found(project_id));
        };

        if project.status == ProjectStatus::Archived {
            return Ok(ToolOutput::Text(format!(
                "Project '{}' is already archived.",
                project.title
            )));
        }

        self.store.archive_project(project_id).await?;
        Ok(ToolOutput::Text(format!(
            "Project '{}' has been archived.",
            project.title
        )))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Projects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::BotDatabase;
    use crate::tools::{ToolCall, ToolRegistry};

    const COMMUNITY: i64 = 100;
    const OTHER_COMMUNITY: i64 = 200;

    fn ctx() -> ToolContext {
        ToolContext {
            community_id: COMMUNITY,
            user_id: 7,
        }
    }

    fn setup() -> (Arc<BotDatabase>, ToolRegistry) {
        let db = Arc::new(BotDatabase::open_in_memory().unwrap());
        let registry = ToolRegistry::with_builtin_tools(db.clone()).unwrap();
        (db, registry)
    }

    async fn run(registry: &ToolRegistry, name: &str, arguments: Value) -> String {
        let call = ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            arguments,
        };
        registry.execute_call(&call, &ctx()).await.content()
    }

    #[tokio::test]
    async fn get_projects_on_empty_community() {
        let (_db, registry) = setup();
        assert_eq!(
            run(&registry, "get_projects", json!({})).await,
            "No projects found."
        );
    }

    #[tokio::test]
    async fn create_then_list_projects() {
        let (db, registry) = setup();
        let out = run(
            &registry,
            "create_project",
            json!({"title": "Rust CLI", "description": "A tiny tool"}),
        )
        .await;
        assert!(out.starts_with("Project 'Rust CLI' created successfully! ID: "));

        let listed = run(&registry, "get_projects", json!({"status": "active"})).await;
        assert!(listed.contains("Title: Rust CLI | Status: active"));

        let projects = db.list_projects(COMMUNITY, None).await.unwrap();
        assert_eq!(projects[0].owners, vec![7]);
    }

    #[tokio::test]
    async fn get_projects_rejects_unknown_status() {
        let (_db, registry) = setup();
        let out = run(&registry, "get_projects", json!({"status": "shipped"})).await;
        assert!(out.starts_with("Error: Unknown status"));
    }

    #[tokio::test]
    async fn project_info_lists_tasks_and_progress() {
        let (db, registry) = setup();
        let id = db
            .create_project(COMMUNITY, "Game jam", None, &[7])
            .await
            .unwrap();
        let task = db.create_task(id, "Sprites", Some(7)).await.unwrap();
        db.create_task(id, "Sound", Some(7)).await.unwrap();
        db.toggle_task(task).await.unwrap();

        let out = run(&registry, "get_project_info", json!({"project_id": id.to_string()})).await;
        assert!(out.contains("**Game jam**"));
        assert!(out.contains("Description: No description"));
        assert!(out.contains("Tasks: 1/2 completed"));
        assert!(out.contains(&format!("[x] [{}] Sprites", task)));
    }

    #[tokio::test]
    async fn foreign_project_is_reported_as_missing() {
        let (db, registry) = setup();
        let foreign = db
            .create_project(OTHER_COMMUNITY, "Secret", None, &[9])
            .await
            .unwrap();

        let info = run(&registry, "get_project_info", json!({"project_id": foreign})).await;
        assert_eq!(
            info,
            format!("Error: Project with ID {} not found.", foreign)
        );

        let archived = run(&registry, "archive_project", json!({"project_id": foreign})).await;
        assert!(archived.starts_with("Error: Project with ID"));
        let project = db.get_project(foreign).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Active);
    }

    #[tokio::test]
    async fn archive_twice_reports_already_archived() {
        let (db, registry) = setup();
        let id = db
            .create_project(COMMUNITY, "Old thing", None, &[7])
            .await
            .unwrap();

        let first = run(&registry, "archive_project", json!({"project_id": id})).await;
        assert_eq!(first, "Project 'Old thing' has been archived.");
        let second = run(&registry, "archive_project", json!({"project_id": id})).await;
        assert_eq!(second, "Project 'Old thing' is already archived.");
    }

    #[tokio::test]
    async fn missing_title_never_touches_storage() {
        let (db, registry) = setup();
        let out = run(&registry, "create_project", json!({"description": "no title"})).await;
        assert_eq!(out, "Error: Missing required argument 'title'");
        assert!(db.list_projects(COMMUNITY, None).await.unwrap().is_empty());
    }
}
