//! Checklist tools for tasks inside a project.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::projects::{load_project, project_not_found, render_task_line};
use super::{arg_i64, arg_str, Tool, ToolCategory, ToolContext, ToolOutput};
use crate::domain::{ProjectStore, Task};

fn task_not_found(task_id: i64) -> ToolOutput {
    ToolOutput::error(format!("Task with ID {} not found.", task_id))
}

/// Load a task, treating one whose project lives in another community as missing.
async fn load_task(
    store: &dyn ProjectStore,
    task_id: i64,
    ctx: &ToolContext,
) -> Result<Option<Task>> {
    let Some(task) = store.get_task(task_id).await? else {
        return Ok(None);
    };
    Ok(load_project(store, task.project_id, ctx).await?.map(|_| task))
}

fn task_id_schema(action: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "task_id": {
                "type": "integer",
                "description": format!("The ID of the task to {}", action)
            }
        },
        "required": ["task_id"]
    })
}

pub struct CreateTaskTool {
    store: Arc<dyn ProjectStore>,
}

impl CreateTaskTool {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for CreateTaskTool {
    fn name(&self) -> &str {
        "create_task"
    }

    fn description(&self) -> &str {
        "Create a new task for a specific project."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "project_id": {
                    "type": "integer",
                    "description": "The ID of the project to add the task to"
                },
                "label": {
                    "type": "string",
                    "description": "The description of the task"
                }
            },
            "required": ["project_id", "label"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(project_id) = arg_i64(&params, "project_id") else {
            return Ok(ToolOutput::error("project_id must be an integer"));
        };
        let Some(label) = arg_str(&params, "label") else {
            return Ok(ToolOutput::error("Missing required argument 'label'"));
        };
        if load_project(self.store.as_ref(), project_id, ctx)
            .await?
            .is_none()
        {
            return Ok(project_not_found(project_id));
        }

        let task_id = self
            .store
            .create_task(project_id, label, Some(ctx.user_id))
            .await?;
        Ok(ToolOutput::Text(format!(
            "Task created successfully! ID: {}",
            task_id
        )))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Tasks
    }
}

pub struct GetTasksTool {
    store: Arc<dyn ProjectStore>,
}

impl GetTasksTool {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for GetTasksTool {
    fn name(&self) -> &str {
        "get_tasks"
    }

    fn description(&self) -> &str {
        "Get all tasks for a specific project."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "project_id": {
                    "type": "integer",
                    "description": "The ID of the project to get tasks for"
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
        if tasks.is_empty() {
            return Ok(ToolOutput::Text(format!(
                "No tasks found for project '{}'.",
                project.title
            )));
        }

        let completed = tasks.iter().filter(|t| t.is_done).count();
        let mut lines = vec![format!("Tasks for **{}**:", project.title)];
        lines.extend(tasks.iter().map(render_task_line));
        lines.push(String::new());
        lines.push(format!("Progress: {}/{} completed", completed, tasks.len()));
        Ok(ToolOutput::Text(lines.join("\n")))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Tasks
    }
}

pub struct ToggleTaskTool {
    store: Arc<dyn ProjectStore>,
}

impl ToggleTaskTool {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ToggleTaskTool {
    fn name(&self) -> &str {
        "toggle_task"
    }

    fn description(&self) -> &str {
        "Toggle a task's completion status (mark as done or undone)."
    }

    fn parameters_schema(&self) -> Value {
        task_id_schema("toggle")
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(task_id) = arg_i64(&params, "task_id") else {
            return Ok(ToolOutput::error("task_id must be an integer"));
        };
        let Some(task) = load_task(self.store.as_ref(), task_id, ctx).await? else {
            return Ok(task_not_found(task_id));
        };

        let done = self.store.toggle_task(task_id).await?;
        let state = if done { "completed" } else { "incomplete" };
        Ok(ToolOutput::Text(format!(
            "Task '{}' marked as {}",
            task.label, state
        )))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Tasks
    }
}

pub struct DeleteTaskTool {
    store: Arc<dyn ProjectStore>,
}

impl DeleteTaskTool {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for DeleteTaskTool {
    fn name(&self) -> &str {
        "delete_task"
    }

    fn description(&self) -> &str {
        "Delete a task from a project."
    }

    fn parameters_schema(&self) -> Value {
        task_id_schema("delete")
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(task_id) = arg_i64(&params, "task_id") else {
            return Ok(ToolOutput::error("task_id must be an integer"));
        };
        let Some(task) = load_task(self.store.as_ref(), task_id, ctx).await? else {
            return Ok(task_not_found(task_id));
        };

        self.store.delete_task(task_id).await?;
        Ok(ToolOutput::Text(format!(
            "Task '{}' has been deleted.",
            task.label
        )))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::BotDatabase;
    use crate::tools::{ToolCall, ToolRegistry};

    fn ctx() -> ToolContext {
        ToolContext {
            community_id: 1,
            user_id: 42,
        }
    }

    async fn run(registry: &ToolRegistry, name: &str, arguments: Value) -> String {
        let call = ToolCall {
            id: "call_t".to_string(),
            name: name.to_string(),
            arguments,
        };
        registry.execute_call(&call, &ctx()).await.content()
    }

    #[tokio::test]
    async fn create_toggle_and_delete_task() {
        let db = Arc::new(BotDatabase::open_in_memory().unwrap());
        let registry = ToolRegistry::with_builtin_tools(db.clone()).unwrap();
        let project = db.create_project(1, "Site", None, &[42]).await.unwrap();

        let created = run(
            &registry,
            "create_task",
            json!({"project_id": project, "label": "Write README"}),
        )
        .await;
        assert!(created.starts_with("Task created successfully! ID: "));
        let task_id = db.list_tasks(project).await.unwrap()[0].id;
        assert_eq!(db.get_task(task_id).await.unwrap().unwrap().created_by, Some(42));

        let toggled = run(&registry, "toggle_task", json!({"task_id": task_id})).await;
        assert_eq!(toggled, "Task 'Write README' marked as completed");
        let toggled = run(&registry, "toggle_task", json!({"task_id": task_id})).await;
        assert_eq!(toggled, "Task 'Write README' marked as incomplete");

        let listed = run(&registry, "get_tasks", json!({"project_id": project})).await;
        assert!(listed.contains("Progress: 0/1 completed"));

        let deleted = run(&registry, "delete_task", json!({"task_id": task_id})).await;
        assert_eq!(deleted, "Task 'Write README' has been deleted.");
        let listed = run(&registry, "get_tasks", json!({"project_id": project})).await;
        assert_eq!(listed, "No tasks found for project 'Site'.");
    }

    #[tokio::test]
    async fn tasks_in_foreign_projects_are_hidden() {
        let db = Arc::new(BotDatabase::open_in_memory().unwrap());
        let registry = ToolRegistry::with_builtin_tools(db.clone()).unwrap();
        let foreign = db.create_project(2, "Theirs", None, &[5]).await.unwrap();
        let task = db.create_task(foreign, "Private", Some(5)).await.unwrap();

        let out = run(&registry, "toggle_task", json!({"task_id": task})).await;
        assert_eq!(out, format!("Error: Task with ID {} not found.", task));
        assert!(!db.get_task(task).await.unwrap().unwrap().is_done);

        let out = run(
            &registry,
            "create_task",
            json!({"project_id": foreign, "label": "Sneaky"}),
        )
        .await;
        assert!(out.starts_with("Error: Project with ID"));
        assert_eq!(db.list_tasks(foreign).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_label_is_reported() {
        let db = Arc::new(BotDatabase::open_in_memory().unwrap());
        let registry = ToolRegistry::with_builtin_tools(db).unwrap();
        let out = run(&registry, "create_task", json!({"project_id": 1})).await;
        assert_eq!(out, "Error: Missing required argument 'label'");
    }
}
