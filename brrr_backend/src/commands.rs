//! Slash commands handled without the model.
//!
//! Commands are routed before the turn engine, so they never show up in the
//! model's context and are never written to history.

use anyhow::Result;
use chrono::{Datelike, Utc};
use rand::seq::IndexedRandom;
use std::sync::Arc;

use crate::agent::IncomingMessage;
use crate::domain::{Idea, Project, ProjectStatus, ProjectStore};
use crate::history::{HistoryFilter, HistoryStore};
use crate::memory::persona::PersonaPreset;
use crate::memory::{MemoryStore, PERSONA_MEMORY_KEY};

pub const MAX_PERSONA_CHARS: usize = 1000;

const MANUAL_MEMORY_CONTEXT: &str = "Manually added by user";
const CUSTOM_PERSONA_CONTEXT: &str = "Custom persona set by user";

/// Entries shown per section of the week overview.
const WEEK_PREVIEW: usize = 5;
/// Ideas offered by a bare `/idea pick`.
const PICK_LIST_LIMIT: usize = 25;

const HELP_TEXT: &str = "brrr! Here's what I can do:

Just talk to me (mention me, reply to me, or DM me) and I can list, create, inspect and archive projects, manage their tasks, and keep an idea pool.

Commands:
/memory show - see what I remember about you
/memory add <key> <value> - tell me something to remember
/memory forget <key> - make me forget one thing
/memory clear - wipe everything I remember about you
/persona show - see your custom instructions
/persona set <instructions> - tell me how to respond to you
/persona preset <concise|detailed|beginner|technical|hype|calm> - pick a style
/persona clear - back to my default personality
/history clear - forget our recent conversation in this chat
/idea pick [id] - turn an unused idea into a project
/idea random - get a random unused idea
/project complete <id> - mark a project as shipped
/week start - overview of active projects and the idea backlog
/week summary - this week's progress in numbers
/help - this message";

const MEMORY_USAGE: &str =
    "Usage: /memory show | /memory add <key> <value> | /memory forget <key> | /memory clear";
const PERSONA_USAGE: &str =
    "Usage: /persona show | /persona set <instructions> | /persona preset <style> | /persona clear";
const HISTORY_USAGE: &str = "Usage: /history clear";
const IDEA_USAGE: &str = "Usage: /idea pick [id] | /idea random";
const PROJECT_USAGE: &str = "Usage: /project complete <id>";
const WEEK_USAGE: &str = "Usage: /week start | /week summary";

const NO_UNUSED_IDEAS: &str = "No unused ideas! Ask me to add one to the idea pool first.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    MemoryShow,
    MemoryAdd { key: String, value: String },
    MemoryForget { key: String },
    MemoryClear,
    PersonaShow,
    PersonaSet { instructions: String },
    PersonaPreset { style: String },
    PersonaClear,
    HistoryClear,
    IdeaPick { idea_id: Option<i64> },
    IdeaRandom,
    ProjectComplete { project_id: i64 },
    WeekStart,
    WeekSummary,
    /// A known command group used with missing or unknown arguments.
    Usage(&'static str),
}

/// Parse `/group sub args...`. Returns `None` when the text is not one of
/// our commands, so the caller can hand it to the turn engine instead.
///
/// Telegram appends `@botname` to commands picked from the menu in groups;
/// that suffix is ignored.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    let rest = text.strip_prefix('/')?;

    let (head, args) = split_word(rest);
    let group = head.split('@').next().unwrap_or(head).to_lowercase();
    let (sub, args) = split_word(args);
    let sub = sub.to_lowercase();

    let command = match group.as_str() {
        "help" | "start" => Command::Help,
        "memory" => match sub.as_str() {
            "show" | "list" => Command::MemoryShow,
            "add" => {
                let (key, value) = split_word(args);
                if key.is_empty() || value.is_empty() {
                    Command::Usage(MEMORY_USAGE)
                } else {
                    Command::MemoryAdd {
                        key: normalize_key(key),
                        value: value.to_string(),
                    }
                }
            }
            "forget" if !args.is_empty() => Command::MemoryForget {
                key: args.to_string(),
            },
            "clear" => Command::MemoryClear,
            _ => Command::Usage(MEMORY_USAGE),
        },
        "persona" => match sub.as_str() {
            "show" => Command::PersonaShow,
            "set" if !args.is_empty() => Command::PersonaSet {
                instructions: args.to_string(),
            },
            "preset" if !args.is_empty() => Command::PersonaPreset {
                style: args.to_string(),
            },
            "clear" | "reset" => Command::PersonaClear,
            _ => Command::Usage(PERSONA_USAGE),
        },
        "history" => match sub.as_str() {
            "clear" => Command::HistoryClear,
            _ => Command::Usage(HISTORY_USAGE),
        },
        "idea" => match sub.as_str() {
            "pick" if args.is_empty() => Command::IdeaPick { idea_id: None },
            "pick" => match parse_id(args) {
                Some(idea_id) => Command::IdeaPick {
                    idea_id: Some(idea_id),
                },
                None => Command::Usage(IDEA_USAGE),
            },
            "random" => Command::IdeaRandom,
            _ => Command::Usage(IDEA_USAGE),
        },
        "project" => match (sub.as_str(), parse_id(args)) {
            ("complete", Some(project_id)) => Command::ProjectComplete { project_id },
            _ => Command::Usage(PROJECT_USAGE),
        },
        "week" => match sub.as_str() {
            "start" => Command::WeekStart,
            "summary" => Command::WeekSummary,
            _ => Command::Usage(WEEK_USAGE),
        },
        _ => return None,
    };
    Some(command)
}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(char::is_whitespace) {
        Some(idx) => (&text[..idx], text[idx..].trim()),
        None => (text, ""),
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace(' ', "_")
}

/// Accepts `12` and `#12`.
fn parse_id(raw: &str) -> Option<i64> {
    raw.trim().trim_start_matches('#').parse().ok()
}

pub struct CommandHandler {
    memory: Arc<dyn MemoryStore>,
    history: Arc<dyn HistoryStore>,
    projects: Arc<dyn ProjectStore>,
}

impl CommandHandler {
    pub fn new(
        memory: Arc<dyn MemoryStore>,
        history: Arc<dyn HistoryStore>,
        projects: Arc<dyn ProjectStore>,
    ) -> Self {
        Self {
            memory,
            history,
            projects,
        }
    }

    /// Run the command in `message`, if any, and return the text to send back.
    pub async fn handle(&self, message: &IncomingMessage) -> Result<Option<String>> {
        let Some(command) = parse_command(&message.text) else {
            return Ok(None);
        };
        tracing::info!(
            "Command from {} in channel {}: {:?}",
            message.author_name,
            message.scope.channel_id,
            command
        );
        self.execute(command, message).await.map(Some)
    }

    async fn execute(&self, command: Command, message: &IncomingMessage) -> Result<String> {
        let user_id = message.scope.user_id;
        let community_id = message.scope.community_id;

        match command {
            Command::Help => Ok(HELP_TEXT.to_string()),
            Command::Usage(usage) => Ok(usage.to_string()),

            Command::MemoryShow => {
                let memories = self.memory.get_all_memories(user_id, community_id).await?;
                let lines: Vec<String> = memories
                    .iter()
                    .filter(|entry| !entry.is_persona())
                    .map(|entry| match entry.context.as_deref() {
                        Some(context) if !context.trim().is_empty() => {
                            format!("- {}: {} ({})", entry.key, entry.value, context.trim())
                        }
                        _ => format!("- {}: {}", entry.key, entry.value),
                    })
                    .collect();
                if lines.is_empty() {
                    return Ok("I don't have any memories about you yet! Chat with me and I'll remember things.".to_string());
                }
                Ok(format!(
                    "What I remember about {}:\n{}\n\nUse /memory forget <key> to remove a memory.",
                    message.author_name,
                    lines.join("\n")
                ))
            }
            Command::MemoryAdd { key, value } => {
                self.memory
                    .set_memory(
                        user_id,
                        community_id,
                        &key,
                        &value,
                        Some(MANUAL_MEMORY_CONTEXT),
                    )
                    .await?;
                Ok(format!("I'll remember: {} = {}", key, value))
            }
            Command::MemoryForget { key } => {
                if self.memory.delete_memory(user_id, community_id, &key).await? {
                    Ok(format!("Forgot: {}", key))
                } else {
                    Ok(format!("I don't have a memory with key {}!", key))
                }
            }
            Command::MemoryClear => {
                let removed = self
                    .memory
                    .clear_all_for_user(user_id, community_id)
                    .await?;
                Ok(format!(
                    "All memories cleared ({} removed). Fresh start!",
                    removed
                ))
            }

            Command::PersonaShow => {
                let current = self
                    .memory
                    .get_memory(user_id, community_id, PERSONA_MEMORY_KEY)
                    .await?;
                match current {
                    Some(entry) if !entry.value.trim().is_empty() => Ok(format!(
                        "Your custom instructions:\n{}\n\nUse /persona set to change or /persona clear to reset.",
                        entry.value
                    )),
                    _ => Ok("You haven't set custom instructions. Use /persona set <instructions> or /persona preset <style> to customize how I respond to you.".to_string()),
                }
            }
            Command::PersonaSet { instructions } => {
                let len = instructions.chars().count();
                if len > MAX_PERSONA_CHARS {
                    return Ok(format!(
                        "Custom instructions are limited to {} characters (yours has {}).",
                        MAX_PERSONA_CHARS, len
                    ));
                }
                self.memory
                    .set_memory(
                        user_id,
                        community_id,
                        PERSONA_MEMORY_KEY,
                        &instructions,
                        Some(CUSTOM_PERSONA_CONTEXT),
                    )
                    .await?;
                Ok("Persona updated! I'll now follow your custom instructions when chatting with you.".to_string())
            }
            Command::PersonaPreset { style } => {
                let Some(preset) = PersonaPreset::from_name(&style) else {
                    let names: Vec<&str> = PersonaPreset::ALL.iter().map(|p| p.name()).collect();
                    return Ok(format!(
                        "Unknown preset '{}'. Pick one of: {}.",
                        style,
                        names.join(", ")
                    ));
                };
                self.memory
                    .set_memory(
                        user_id,
                        community_id,
                        PERSONA_MEMORY_KEY,
                        preset.instructions(),
                        Some(&format!("Preset: {}", preset.name())),
                    )
                    .await?;
                Ok(format!(
                    "Persona: {}\nI'll now respond in this style:\n{}",
                    preset.label(),
                    preset.instructions()
                ))
            }
            Command::PersonaClear => {
                self.memory
                    .delete_memory(user_id, community_id, PERSONA_MEMORY_KEY)
                    .await?;
                Ok("Persona reset to default! I'll respond with my standard personality now.".to_string())
            }

            Command::HistoryClear => {
                let removed = self
                    .history
                    .clear_history(HistoryFilter::from(message.scope))
                    .await?;
                Ok(format!(
                    "Cleared {} messages from our conversation here.",
                    removed
                ))
            }

            Command::IdeaPick { idea_id: None } => {
                let ideas = self.projects.list_ideas(community_id, true).await?;
                if ideas.is_empty() {
                    return Ok(NO_UNUSED_IDEAS.to_string());
                }
                let mut lines =
                    vec!["Pick an idea to turn into a project with /idea pick <id>:".to_string()];
                lines.extend(
                    ideas
                        .iter()
                        .take(PICK_LIST_LIMIT)
                        .map(|idea| format!("  [{}] {}", idea.id, idea.title)),
                );
                Ok(lines.join("\n"))
            }
            Command::IdeaPick {
                idea_id: Some(idea_id),
            } => self.pick_idea(idea_id, message).await,
            Command::IdeaRandom => {
                let ideas = self.projects.list_ideas(community_id, true).await?;
                // ThreadRng is not Send; keep it out of the await points.
                let picked = {
                    let mut rng = rand::rng();
                    ideas.choose(&mut rng).cloned()
                };
                let Some(idea) = picked else {
                    return Ok("No unused ideas to pick from!".to_string());
                };
                let mut text = format!("Random idea: {}", idea.title);
                if let Some(description) = idea.description.as_deref() {
                    text.push_str(&format!("\n{}", description));
                }
                text.push_str(&format!(
                    "\nIdea #{}. Use /idea pick {} to start this project!",
                    idea.id, idea.id
                ));
                Ok(text)
            }

            Command::ProjectComplete { project_id } => {
                let Some(project) = self.community_project(project_id, community_id).await? else {
                    return Ok(format!("Project with ID {} not found.", project_id));
                };
                if project.status == ProjectStatus::Completed {
                    return Ok(format!("Project '{}' is already completed.", project.title));
                }
                self.projects.complete_project(project_id).await?;
                Ok(format!(
                    "Project '{}' marked as completed. Shipped, brrr!",
                    project.title
                ))
            }

            Command::WeekStart => self.week_start(community_id).await,
            Command::WeekSummary => self.week_summary(community_id).await,
        }
    }

    async fn community_project(
        &self,
        project_id: i64,
        community_id: i64,
    ) -> Result<Option<Project>> {
        Ok(self
            .projects
            .get_project(project_id)
            .await?
            .filter(|project| project.community_id == community_id))
    }

    async fn community_idea(&self, idea_id: i64, community_id: i64) -> Result<Option<Idea>> {
        Ok(self
            .projects
            .get_idea(idea_id)
            .await?
            .filter(|idea| idea.community_id == community_id))
    }

    /// Start a project from an idea: the project takes the idea's title and
    /// description, the caller owns it, and the idea is marked used.
    async fn pick_idea(&self, idea_id: i64, message: &IncomingMessage) -> Result<String> {
        let community_id = message.scope.community_id;
        let Some(idea) = self.community_idea(idea_id, community_id).await? else {
            return Ok(format!("Idea with ID {} not found.", idea_id));
        };
        if let Some(project_id) = idea.used_project_id {
            return Ok(format!(
                "Idea '{}' was already picked for project {}.",
                idea.title, project_id
            ));
        }

        let project_id = self
            .projects
            .create_project(
                community_id,
                &idea.title,
                idea.description.as_deref(),
                &[message.scope.user_id],
            )
            .await?;
        self.projects.mark_idea_used(idea.id, project_id).await?;
        tracing::info!(
            "Idea {} picked by {} as project {}",
            idea.id,
            message.author_name,
            project_id
        );

        Ok(format!(
            "Project created from idea! '{}' is now a project (ID: {}). Ask me to add tasks to it.",
            idea.title, project_id
        ))
    }

    /// Done and total task counts for a project.
    async fn progress(&self, project_id: i64) -> Result<(usize, usize)> {
        let tasks = self.projects.list_tasks(project_id).await?;
        let done = tasks.iter().filter(|task| task.is_done).count();
        Ok((done, tasks.len()))
    }

    async fn week_start(&self, community_id: i64) -> Result<String> {
        let active = self
            .projects
            .list_projects(community_id, Some(ProjectStatus::Active))
            .await?;
        let ideas = self.projects.list_ideas(community_id, true).await?;

        let mut sections = vec![format!(
            "Week {} - Let's Go BRRRRRR!\nNew week, new opportunities to ship! Here's your overview.",
            Utc::now().iso_week().week()
        )];

        if active.is_empty() {
            sections.push("Active projects: none! Time to start something new!".to_string());
        } else {
            let mut lines = vec![format!("Active projects ({}):", active.len())];
            for project in active.iter().take(WEEK_PREVIEW) {
                let (done, total) = self.progress(project.id).await?;
                if total == 0 {
                    lines.push(format!("- {}", project.title));
                } else {
                    lines.push(format!("- {} [{}/{}]", project.title, done, total));
                }
            }
            if active.len() > WEEK_PREVIEW {
                lines.push(format!("...and {} more", active.len() - WEEK_PREVIEW));
            }
            sections.push(lines.join("\n"));
        }

        if ideas.is_empty() {
            sections.push(
                "Idea backlog: empty! Ask me to add an idea to capture inspiration.".to_string(),
            );
        } else {
            let mut lines = vec![format!("Idea backlog ({}):", ideas.len())];
            lines.extend(
                ideas
                    .iter()
                    .take(WEEK_PREVIEW)
                    .map(|idea| format!("- {}", idea.title)),
            );
            sections.push(lines.join("\n"));
        }

        sections.push(
            "This week's focus:\n- Pick ONE project to focus on shipping\n- Break it down into small, achievable tasks\n- Ship something - done is better than perfect!"
                .to_string(),
        );
        Ok(sections.join("\n\n"))
    }

    async fn week_summary(&self, community_id: i64) -> Result<String> {
        let active = self
            .projects
            .list_projects(community_id, Some(ProjectStatus::Active))
            .await?;
        let week_ago = Utc::now() - chrono::Duration::days(7);
        let archived_this_week = self
            .projects
            .list_projects(community_id, Some(ProjectStatus::Archived))
            .await?
            .into_iter()
            .filter(|project| project.archived_at.is_some_and(|at| at >= week_ago))
            .count();

        let mut done = 0;
        let mut total = 0;
        for project in &active {
            let (project_done, project_total) = self.progress(project.id).await?;
            done += project_done;
            total += project_total;
        }

        let mut lines = vec![
            "Weekly Progress Summary".to_string(),
            format!("Active projects: {}", active.len()),
            format!("Tasks done: {}/{}", done, total),
        ];
        if total > 0 {
            lines.push(format!(
                "Completion rate: {:.1}%",
                done as f64 / total as f64 * 100.0
            ));
        }
        lines.push(format!("Archived this week: {}", archived_this_week));
        Ok(lines.join("\n"))
    }
}
