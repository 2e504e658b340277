//! Idea pool tools.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{arg_bool, arg_i64, arg_str, Tool, ToolCategory, ToolContext, ToolOutput};
use crate::domain::ProjectStore;

const IDEA_PREVIEW_CHARS: usize = 50;

pub struct AddIdeaTool {
    store: Arc<dyn ProjectStore>,
}

impl AddIdeaTool {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for AddIdeaTool {
    fn name(&self) -> &str {
        "add_idea"
    }

    fn description(&self) -> &str {
        "Add a new project idea to the idea pool."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "The title of the idea"
                },
                "description": {
                    "type": "string",
                    "description": "A detailed description of the idea"
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
        let idea_id = self
            .store
            .create_idea(ctx.community_id, ctx.user_id, title, description)
            .await?;
        Ok(ToolOutput::Text(format!("Idea added! ID: {}", idea_id)))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Ideas
    }
}

pub struct GetIdeasTool {
    store: Arc<dyn ProjectStore>,
}

impl GetIdeasTool {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for GetIdeasTool {
    fn name(&self) -> &str {
        "get_ideas"
    }

    fn description(&self) -> &str {
        "Get project ideas from the idea pool."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "unused_only": {
                    "type": "boolean",
                    "description": "If true, only return ideas that haven't been used for a project yet"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let unused_only = arg_bool(&params, "unused_only").unwrap_or(false);
        let ideas = self.store.list_ideas(ctx.community_id, unused_only).await?;
        if ideas.is_empty() {
            let filter = if unused_only { " (unused)" } else { "" };
            return Ok(ToolOutput::Text(format!(
                "No ideas{} found in the idea pool.",
                filter
            )));
        }

        let mut lines = vec!["**Idea Pool:**".to_string()];
        for idea in &ideas {
            let used = if idea.used_project_id.is_some() {
                " (used)"
            } else {
                ""
            };
            let preview = idea
                .description
                .as_deref()
                .map(|d| {
                    let short: String = d.chars().take(IDEA_PREVIEW_CHARS).collect();
                    format!(" - {}...", short)
                })
                .unwrap_or_default();
            lines.push(format!("  [{}] {}{}{}", idea.id, idea.title, used, preview));
        }
        Ok(ToolOutput::Text(lines.join("\n")))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Ideas
    }
}

pub struct DeleteIdeaTool {
    store: Arc<dyn ProjectStore>,
}

impl DeleteIdeaTool {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for DeleteIdeaTool {
    fn name(&self) -> &str {
        "delete_idea"
    }

    fn description(&self) -> &str {
        "Delete an idea from the idea pool."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "idea_id": {
                    "type": "integer",
                    "description": "The ID of the idea to delete"
                }
            },
            "required": ["idea_id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(idea_id) = arg_i64(&params, "idea_id") else {
            return Ok(ToolOutput::error("idea_id must be an integer"));
        };
        let idea = self
            .store
            .get_idea(idea_id)
            .await?
            .filter(|idea| idea.community_id == ctx.community_id);
        let Some(idea) = idea else {
            return Ok(ToolOutput::error(format!(
                "Idea with ID {} not found.",
                idea_id
            )));
        };

        self.store.delete_idea(idea_id).await?;
        Ok(ToolOutput::Text(format!(
            "Idea '{}' has been deleted.",
            idea.title
        )))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Ideas
    }
}
