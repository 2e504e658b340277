//! System prompt assembly.

use crate::history::{ConversationTurn, Role};
use crate::memory::directive::DIRECTIVE_FENCE;
use crate::memory::MemoryEntry;

const PERSONALITY: &str = "**Your personality:**
- You go brrrrrrrrr (fast, efficient, high-energy)
- You're enthusiastic about coding projects and helping people build cool stuff
- You keep responses concise but helpful
- You use occasional \"brrr\" sounds when excited
- You're supportive and encourage people to ship their projects";

const CAPABILITIES: &str = "**Your capabilities:**
- Help plan and manage weekly coding projects (you can list, create, inspect and archive projects, manage their task checklists, and keep an idea pool using your tools)
- Answer coding questions
- Remember things about users to personalize interactions
- Provide encouragement and motivation";

const COMMANDS: &str = "**Chat commands:**
- `/help` shows every command.
- `/memory show|add|forget|clear` lets people inspect and adjust what you remember about them.
- `/persona show|set|preset|clear` lets people customize how you respond to them.
- `/history clear` wipes your recent conversation with them in this chat.
- `/idea pick [id]` and `/idea random` turn unused ideas into projects.
- `/project complete <id>` marks a project as shipped.
- `/week start|summary` shows the weekly overview and progress.
- People can talk to you by mentioning you, replying to your messages, or messaging you directly.

When someone asks what you can do or whether you have commands, mention these and suggest `/help`.";

const OUTRO: &str = "Remember: You're here to help make weekly projects go BRRRRR!";

fn memory_instructions() -> String {
    format!(
        "**Memory System:**
You can remember things about users. When you learn something worth remembering about a user (their preferences, skills, current projects, interests, timezone, etc.), include it at the END of your message in this format:

{}
{{\"memories\": [{{\"key\": \"skill_python\", \"value\": \"advanced\", \"context\": \"mentioned they've been coding Python for 5 years\"}}]}}
```

Memory keys should be descriptive like: current_project, skill_<language>, interest_<topic>, timezone, preferred_name, etc.
Only save memories that would be useful for future interactions. Don't save trivial or temporary information.",
        DIRECTIVE_FENCE
    )
}

/// Everything the prompt is built from. Optional inputs that are absent or
/// empty drop their section.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub user_name: &'a str,
    pub memories: &'a [MemoryEntry],
    pub custom_instructions: Option<&'a str>,
    pub history: &'a [ConversationTurn],
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    bot_name: String,
}

impl PromptBuilder {
    pub fn new(bot_name: impl Into<String>) -> Self {
        Self {
            bot_name: bot_name.into(),
        }
    }

    /// Deterministic for identical inputs.
    pub fn build(&self, inputs: &PromptInputs<'_>) -> String {
        let mut sections = vec![
            format!(
                "You are {}, an energetic and helpful assistant for a community focused on weekly coding projects.",
                self.bot_name
            ),
            PERSONALITY.to_string(),
            CAPABILITIES.to_string(),
            COMMANDS.to_string(),
        ];

        if let Some(custom) = inputs
            .custom_instructions
            .map(str::trim)
            .filter(|text| !text.is_empty())
        {
            sections.push(format!(
                "**User's Custom Instructions (IMPORTANT - follow these closely):**\n{}",
                custom
            ));
        }

        sections.push(memory_instructions());

        if let Some(remembered) = self.memory_section(inputs) {
            sections.push(remembered);
        }
        if let Some(transcript) = self.history_section(inputs) {
            sections.push(transcript);
        }

        sections.push(format!(
            "**Current context:**\nYou're chatting with {}. Respond to their NEW message below.",
            inputs.user_name
        ));
        sections.push(OUTRO.to_string());

        sections.join("\n\n")
    }

    fn memory_section(&self, inputs: &PromptInputs<'_>) -> Option<String> {
        let lines: Vec<String> = inputs
            .memories
            .iter()
            .filter(|entry| !entry.is_persona())
            .map(|entry| match entry.context.as_deref().map(str::trim) {
                Some(context) if !context.is_empty() => {
                    format!("- {}: {} ({})", entry.key, entry.value, context)
                }
                _ => format!("- {}: {}", entry.key, entry.value),
            })
            .collect();
        if lines.is_empty() {
            return None;
        }
        Some(format!(
            "**What I remember about {}:**\n{}",
            inputs.user_name,
            lines.join("\n")
        ))
    }

    fn history_section(&self, inputs: &PromptInputs<'_>) -> Option<String> {
        if inputs.history.is_empty() {
            return None;
        }
        let lines: Vec<String> = inputs
            .history
            .iter()
            .map(|turn| match turn.role {
                Role::User => format!("{}: {}", inputs.user_name, turn.content),
                Role::Assistant => format!("You ({}): {}", self.bot_name, turn.content),
            })
            .collect();
        Some(format!(
            "**Recent conversation context (for reference only - respond to the NEW message below, not these):**\n{}",
            lines.join("\n")
        ))
    }
}
