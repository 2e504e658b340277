//! Tool catalog the model can call while answering a chat message.
//!
//! Each tool declares a JSON Schema for its parameters and renders its result
//! as text. Tools never fail the turn: missing arguments, unknown ids, foreign
//! community records and store failures all come back as `Error: ...` text the
//! model can read and explain.
//!
//! The registry is assembled once at startup and is read-only afterwards, so
//! dispatch is a single map lookup.

pub mod ideas;
pub mod projects;
pub mod tasks;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::ProjectStore;

/// Prefix every failed tool result starts with.
pub const TOOL_ERROR_MARKER: &str = "Error: ";

/// Category of tool, used for grouping in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolCategory {
    Projects,
    Tasks,
    Ideas,
    /// Anything reaching outside the project board
    Integration,
}

/// The result of executing a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolOutput {
    Text(String),
    Error(String),
}

impl ToolOutput {
    /// Convert to the text fed back to the model as the tool message.
    pub fn to_llm_string(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Error(e) => format!("{}{}", TOOL_ERROR_MARKER, e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutput::Text(_))
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        ToolOutput::Error(message.into())
    }
}

/// Who is calling. Every tool scopes its reads and writes to this community.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolContext {
    pub community_id: i64,
    pub user_id: i64,
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Wire name used in function-calling (e.g. "get_projects")
    fn name(&self) -> &str;

    /// Human-readable description shown to the model
    fn description(&self) -> &str;

    /// JSON Schema for the parameters, used verbatim in the function definition.
    /// Its `required` list is enforced by the registry before `execute` runs.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. An `Err` is treated as an internal failure: it is logged
    /// and replaced by a generic error text before reaching the model.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput>;

    fn category(&self) -> ToolCategory;
}

/// OpenAI-format function definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// OpenAI-format tool definition (wraps FunctionDef)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

/// A tool call the model asked for, with arguments already decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Result of a tool call, ready to feed back to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub name: String,
    pub output: ToolOutput,
}

impl ToolCallResult {
    pub fn content(&self) -> String {
        self.output.to_llm_string()
    }
}

/// Decode raw tool-call arguments. Anything that is not a JSON object becomes
/// an empty object so a sloppy call still reaches the tool's own validation.
pub fn parse_tool_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            tracing::warn!("Tool arguments were not an object ({}), using {{}}", other);
            Value::Object(Default::default())
        }
        Err(e) => {
            tracing::warn!("Failed to parse tool arguments as JSON: {}", e);
            Value::Object(Default::default())
        }
    }
}

/// Read-only registry of tools, keyed by wire name.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Build the registry. Duplicate names are rejected so a later tool can
    /// never shadow an earlier one.
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(tools.len());
        for (idx, tool) in tools.iter().enumerate() {
            let name = tool.name().to_string();
            if by_name.insert(name.clone(), idx).is_some() {
                anyhow::bail!("Tool '{}' registered twice", name);
            }
            tracing::info!(
                "Registered tool: {} (category: {:?})",
                name,
                tool.category()
            );
        }
        Ok(Self { tools, by_name })
    }

    /// The built-in project board tools, in the order the model sees them.
    pub fn with_builtin_tools(store: Arc<dyn ProjectStore>) -> Result<Self> {
        Self::new(builtin_tools(store))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.by_name.get(name).map(|&idx| &self.tools[idx])
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// OpenAI-format definitions in registration order.
    pub fn tool_definitions(&self) -> Vec<ToolDef> {
        self.tools
            .iter()
            .map(|tool| ToolDef {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect()
    }

    /// Execute one call. Never fails: every problem becomes an error output.
    pub async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> ToolCallResult {
        let output = self.dispatch(call, ctx).await;
        if !output.is_success() {
            tracing::debug!("Tool {} returned error: {:?}", call.name, output);
        }
        ToolCallResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            output,
        }
    }

    async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let Some(tool) = self.get(&call.name) else {
            return ToolOutput::error(format!("Unknown tool '{}'", call.name));
        };

        if let Some(missing) = first_missing_required(&tool.parameters_schema(), &call.arguments)
        {
            return ToolOutput::error(format!("Missing required argument '{}'", missing));
        }

        tracing::info!("Executing tool {} with args {}", call.name, call.arguments);
        match tool.execute(call.arguments.clone(), ctx).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!("Tool {} failed: {:#}", call.name, e);
                ToolOutput::error(format!("{} could not be completed right now.", call.name))
            }
        }
    }

    /// Execute calls one after another, preserving order.
    pub async fn execute_calls(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolCallResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute_call(call, ctx).await);
        }
        results
    }
}

fn builtin_tools(store: Arc<dyn ProjectStore>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(projects::GetProjectsTool::new(store.clone())),
        Arc::new(projects::CreateProjectTool::new(store.clone())),
        Arc::new(projects::GetProjectInfoTool::new(store.clone())),
        Arc::new(projects::ArchiveProjectTool::new(store.clone())),
        Arc::new(tasks::CreateTaskTool::new(store.clone())),
        Arc::new(tasks::GetTasksTool::new(store.clone())),
        Arc::new(tasks::ToggleTaskTool::new(store.clone())),
        Arc::new(tasks::DeleteTaskTool::new(store.clone())),
        Arc::new(ideas::AddIdeaTool::new(store.clone())),
        Arc::new(ideas::GetIdeasTool::new(store.clone())),
        Arc::new(ideas::DeleteIdeaTool::new(store)),
    ]
}

fn first_missing_required(schema: &Value, params: &Value) -> Option<String> {
    schema
        .get("required")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(Value::as_str)
        .find(|name| match params.get(*name) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        })
        .map(str::to_string)
}

// ─── Argument helpers ────────────────────────────────────────────────────────

/// Integer argument; numeric strings are accepted since models often quote ids.
pub(crate) fn arg_i64(params: &Value, name: &str) -> Option<i64> {
    match params.get(name)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Non-blank, trimmed string argument.
pub(crate) fn arg_str<'a>(params: &'a Value, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) fn arg_bool(params: &Value, name: &str) -> Option<bool> {
    match params.get(name)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
