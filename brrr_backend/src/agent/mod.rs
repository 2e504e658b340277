//! The conversational turn engine.
//!
//! One incoming message becomes one turn: gather memories and sanitized
//! history, call the model, run any requested tools and feed their results
//! back, then persist the exchange and deliver the reply. Turns in the same
//! channel are serialized; different channels run concurrently.

pub mod prompt;
pub mod reply;

use anyhow::{Context, Result};
use regex_lite::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::BotConfig;
use crate::history::{sanitize_history, ConversationScope, HistoryStore, Role};
use crate::llm_client::{ModelGateway, ModelOptions, ModelTurnResult};
use crate::memory::{persona_instructions, MemoryStore};
use crate::tools::{parse_tool_arguments, ToolCall, ToolContext, ToolRegistry};

use prompt::{PromptBuilder, PromptInputs};
use reply::{deliver, ReplySink, ERROR_REPLY};

/// Ceiling on model calls per turn, the first call included.
pub const MAX_TOOL_ROUNDS: usize = 5;

pub const TOO_MANY_STEPS_REPLY: &str = "I tried to complete your request but it required too many steps. Please try breaking it into smaller requests.";

/// Used when the message is empty once mentions are stripped.
pub const DEFAULT_GREETING: &str = "Hello!";

/// A chat message as the platform adapter hands it over.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub scope: ConversationScope,
    pub author_name: String,
    pub author_is_bot: bool,
    pub text: String,
    /// Mention markup addressing the bot (e.g. `@brrr_bot`), removed before the
    /// text reaches the model.
    pub mentions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    HistoryGathered,
    Round(usize),
    Completed,
    Failed,
}

/// One async mutex per channel, created on first use.
///
/// Gates nobody holds or waits on are dropped on the next `acquire`, so the
/// map only tracks channels with a turn in flight.
#[derive(Default)]
pub struct ChannelGates {
    gates: std::sync::Mutex<HashMap<(i64, i64), Arc<Mutex<()>>>>,
}

impl ChannelGates {
    /// Wait for exclusive access to the channel. Released when the guard drops.
    pub async fn acquire(&self, community_id: i64, channel_id: i64) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.lock_gates();
            // The map's own Arc is the only reference left once a gate is idle.
            gates.retain(|_, gate| Arc::strong_count(gate) > 1);
            gates
                .entry((community_id, channel_id))
                .or_default()
                .clone()
        };
        gate.lock_owned().await
    }

    /// Number of channels with a live gate.
    pub fn tracked_channels(&self) -> usize {
        self.lock_gates().len()
    }

    fn lock_gates(&self) -> std::sync::MutexGuard<'_, HashMap<(i64, i64), Arc<Mutex<()>>>> {
        self.gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub bot_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub history_fetch_limit: usize,
    pub max_message_chars: usize,
}

impl From<&BotConfig> for TurnSettings {
    fn from(config: &BotConfig) -> Self {
        Self {
            bot_name: config.bot_name.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            history_fetch_limit: config.history_fetch_limit,
            max_message_chars: config.max_message_chars,
        }
    }
}

pub struct TurnOrchestrator {
    memory: Arc<dyn MemoryStore>,
    history: Arc<dyn HistoryStore>,
    gateway: Arc<dyn ModelGateway>,
    tools: Arc<ToolRegistry>,
    prompts: PromptBuilder,
    options: ModelOptions,
    history_fetch_limit: usize,
    max_message_chars: usize,
    gates: ChannelGates,
}

impl TurnOrchestrator {
    pub fn new(
        memory: Arc<dyn MemoryStore>,
        history: Arc<dyn HistoryStore>,
        gateway: Arc<dyn ModelGateway>,
        tools: Arc<ToolRegistry>,
        settings: TurnSettings,
    ) -> Self {
        let options = ModelOptions {
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            tools: tools.tool_definitions(),
        };
        Self {
            memory,
            history,
            gateway,
            tools,
            prompts: PromptBuilder::new(settings.bot_name),
            options,
            history_fetch_limit: settings.history_fetch_limit,
            max_message_chars: settings.max_message_chars,
            gates: ChannelGates::default(),
        }
    }

    /// Process one message end to end. Never fails: errors are logged and the
    /// user gets a fixed apology.
    pub async fn handle_incoming_message(&self, message: &IncomingMessage, sink: &dyn ReplySink) {
        let scope = message.scope;
        let _gate = self
            .gates
            .acquire(scope.community_id, scope.channel_id)
            .await;

        let mut phase = TurnPhase::Idle;
        let content = match self.run_turn(message, &mut phase).await {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(
                    "Turn for user {} in channel {} failed during {:?}: {:#}",
                    scope.user_id,
                    scope.channel_id,
                    phase,
                    e
                );
                phase = TurnPhase::Failed;
                ERROR_REPLY.to_string()
            }
        };

        if let Err(e) = deliver(sink, &content, self.max_message_chars).await {
            tracing::error!("Failed to deliver reply in channel {}: {:#}", scope.channel_id, e);
            if phase != TurnPhase::Failed {
                if let Err(e) = sink.reply(ERROR_REPLY).await {
                    tracing::error!("Failed to deliver error reply: {:#}", e);
                }
            }
        }
    }

    async fn run_turn(&self, message: &IncomingMessage, phase: &mut TurnPhase) -> Result<String> {
        let scope = message.scope;

        let memories = self
            .memory
            .get_all_memories(scope.user_id, scope.community_id)
            .await
            .context("Failed to load memories")?;
        let raw_history = self
            .history
            .get_recent_turns(scope, self.history_fetch_limit)
            .await
            .context("Failed to load conversation history")?;
        let history = sanitize_history(&raw_history);
        tracing::debug!(
            "Filtered history: {} -> {} messages",
            raw_history.len(),
            history.len()
        );

        let user_text = prepare_user_text(message);
        *phase = TurnPhase::HistoryGathered;

        let system_prompt = self.prompts.build(&PromptInputs {
            user_name: &message.author_name,
            memories: &memories,
            custom_instructions: persona_instructions(&memories),
            history: &history,
        });
        let tool_ctx = ToolContext {
            community_id: scope.community_id,
            user_id: scope.user_id,
        };

        let result = self
            .run_rounds(&system_prompt, &user_text, &tool_ctx, phase)
            .await?;

        self.history
            .append_turn(scope, Role::User, &user_text)
            .await
            .context("Failed to save user turn")?;
        self.history
            .append_turn(scope, Role::Assistant, &result.content)
            .await
            .context("Failed to save assistant turn")?;

        for proposed in &result.memories {
            let key = proposed.key_or_default();
            let value = proposed.value_or_default();
            self.memory
                .set_memory(
                    scope.user_id,
                    scope.community_id,
                    key,
                    value,
                    proposed.context.as_deref(),
                )
                .await
                .with_context(|| format!("Failed to save memory '{}'", key))?;
            tracing::info!(
                "Saved memory for {}: {} = {}",
                message.author_name,
                key,
                value
            );
        }

        *phase = TurnPhase::Completed;
        Ok(result.content)
    }

    async fn run_rounds(
        &self,
        system_prompt: &str,
        user_text: &str,
        tool_ctx: &ToolContext,
        phase: &mut TurnPhase,
    ) -> Result<ModelTurnResult> {
        let mut round = 1;
        *phase = TurnPhase::Round(round);
        let mut result = self
            .gateway
            .complete(system_prompt, user_text, &self.options)
            .await?;

        while result.has_tool_calls() && round < MAX_TOOL_ROUNDS {
            round += 1;
            *phase = TurnPhase::Round(round);
            tracing::debug!(
                "Tool round {}: processing {} tool calls",
                round - 1,
                result.tool_calls.len()
            );

            let calls: Vec<ToolCall> = result
                .tool_calls
                .iter()
                .map(|tc| ToolCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: parse_tool_arguments(&tc.function.arguments),
                })
                .collect();
            let results = self.tools.execute_calls(&calls, tool_ctx).await;

            result = self
                .gateway
                .continue_with_tool_results(
                    system_prompt,
                    user_text,
                    &result.tool_calls,
                    &results,
                    &self.options,
                )
                .await?;
        }

        if result.has_tool_calls() {
            tracing::warn!(
                "Hit max tool rounds ({}), forcing response",
                MAX_TOOL_ROUNDS
            );
            result.content = TOO_MANY_STEPS_REPLY.to_string();
            result.tool_calls.clear();
        }
        Ok(result)
    }
}

/// Strip mentions, default empty text, and flag messages from other bots.
fn prepare_user_text(message: &IncomingMessage) -> String {
    let cleaned = strip_mentions(&message.text, &message.mentions);
    let text = if cleaned.is_empty() {
        DEFAULT_GREETING.to_string()
    } else {
        cleaned
    };
    if message.author_is_bot {
        format!(
            "[This message is from another bot named {}] {}",
            message.author_name, text
        )
    } else {
        text
    }
}

fn strip_mentions(text: &str, mentions: &[String]) -> String {
    let alternatives: Vec<String> = mentions
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .map(regex_lite::escape)
        .collect();
    if alternatives.is_empty() {
        return text.trim().to_string();
    }

    match Regex::new(&format!("(?i)(?:{})", alternatives.join("|"))) {
        Ok(pattern) => pattern.replace_all(text, "").trim().to_string(),
        Err(e) => {
            tracing::warn!("Could not build mention pattern: {}", e);
            text.trim().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::reply::tests::{RecordingSink, Sent};
    use super::*;
    use crate::database::BotDatabase;
    use crate::history::HistoryFilter;
    use crate::llm_client::tests::{completion, ScriptedTransport};
    use crate::llm_client::{GatewayError, LlmClient, LlmFunctionCall, LlmToolCall, Usage};
    use crate::memory::ProposedMemory;
    use crate::tools::ToolCallResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scope() -> ConversationScope {
        ConversationScope {
            user_id: 11,
            community_id: 22,
            channel_id: 33,
        }
    }

    fn message(text: &str) -> IncomingMessage {
        IncomingMessage {
            scope: scope(),
            author_name: "Ada".to_string(),
            author_is_bot: false,
            text: text.to_string(),
            mentions: vec!["@brrr_bot".to_string()],
        }
    }

    fn settings() -> TurnSettings {
        TurnSettings::from(&BotConfig::default())
    }

    fn orchestrator(db: Arc<BotDatabase>, gateway: Arc<dyn ModelGateway>) -> TurnOrchestrator {
        let tools = Arc::new(ToolRegistry::with_builtin_tools(db.clone()).unwrap());
        TurnOrchestrator::new(db.clone(), db, gateway, tools, settings())
    }

    fn text_result(content: &str) -> ModelTurnResult {
        ModelTurnResult {
            content: content.to_string(),
            memories: Vec::new(),
            tool_calls: Vec::new(),
            usage: Usage::default(),
            finish_reason: Some("stop".to_string()),
        }
    }

    fn tool_call(id: &str, name: &str, arguments: &str) -> LlmToolCall {
        LlmToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: LlmFunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    /// Always asks for another tool call.
    #[derive(Default)]
    struct LoopingGateway {
        calls: AtomicUsize,
    }

    impl LoopingGateway {
        fn next(&self) -> ModelTurnResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut result = text_result("still working");
            result.tool_calls = vec![tool_call(&format!("call_{}", n), "get_projects", "{}")];
            result
        }
    }

    #[async_trait]
    impl ModelGateway for LoopingGateway {
        async fn complete(
            &self,
            _system_prompt: &str,
            _user_message: &str,
            _options: &ModelOptions,
        ) -> Result<ModelTurnResult, GatewayError> {
            Ok(self.next())
        }

        async fn continue_with_tool_results(
            &self,
            _system_prompt: &str,
            _user_message: &str,
            _prior_tool_calls: &[LlmToolCall],
            _tool_results: &[ToolCallResult],
            _options: &ModelOptions,
        ) -> Result<ModelTurnResult, GatewayError> {
            Ok(self.next())
        }
    }

    /// Records what the orchestrator sends and replies with fixed results.
    struct RecordingGateway {
        reply: ModelTurnResult,
        user_messages: std::sync::Mutex<Vec<String>>,
        system_prompts: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingGateway {
        fn new(reply: ModelTurnResult) -> Self {
            Self {
                reply,
                user_messages: std::sync::Mutex::new(Vec::new()),
                system_prompts: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelGateway for RecordingGateway {
        async fn complete(
            &self,
            system_prompt: &str,
            user_message: &str,
            _options: &ModelOptions,
        ) -> Result<ModelTurnResult, GatewayError> {
            self.system_prompts
                .lock()
                .unwrap()
                .push(system_prompt.to_string());
            self.user_messages
                .lock()
                .unwrap()
                .push(user_message.to_string());
            Ok(self.reply.clone())
        }

        async fn continue_with_tool_results(
            &self,
            _system_prompt: &str,
            _user_message: &str,
            _prior_tool_calls: &[LlmToolCall],
            _tool_results: &[ToolCallResult],
            _options: &ModelOptions,
        ) -> Result<ModelTurnResult, GatewayError> {
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn runaway_tool_loop_is_cut_off_after_five_calls() {
        let db = Arc::new(BotDatabase::open_in_memory().unwrap());
        let gateway = Arc::new(LoopingGateway::default());
        let engine = orchestrator(db.clone(), gateway.clone());
        let sink = RecordingSink::default();

        engine
            .handle_incoming_message(&message("@brrr_bot list everything"), &sink)
            .await;

        assert_eq!(gateway.calls.load(Ordering::SeqCst), MAX_TOOL_ROUNDS);
        assert_eq!(
            sink.messages(),
            vec![Sent::Reply(TOO_MANY_STEPS_REPLY.to_string())]
        );

        let turns = db.get_recent_turns(scope(), 10).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].content, "list everything");
        assert_eq!(turns[1].content, TOO_MANY_STEPS_REPLY);
    }

    #[tokio::test]
    async fn tool_result_is_fed_back_verbatim_in_round_two() {
        let db = Arc::new(BotDatabase::open_in_memory().unwrap());
        let first = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "get_projects", "arguments": ""}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(first),
            Ok(completion(json!("No projects yet. Want to start one?"), "stop")),
        ]));
        let gateway = Arc::new(LlmClient::new(transport.clone(), "primary", "fallback", 256));
        let engine = orchestrator(db.clone(), gateway);
        let sink = RecordingSink::default();

        engine
            .handle_incoming_message(&message("what projects do we have?"), &sink)
            .await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.as_ref().map(Vec::len), Some(11));
        let tool_message = requests[1]
            .messages
            .iter()
            .find(|m| m.role == "tool")
            .expect("tool message in round two");
        assert_eq!(tool_message.content.as_deref(), Some("No projects found."));
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_abc"));
        assert_eq!(
            sink.messages(),
            vec![Sent::Reply("No projects yet. Want to start one?".to_string())]
        );
    }

    #[tokio::test]
    async fn memories_are_upserted_with_defaults() {
        let db = Arc::new(BotDatabase::open_in_memory().unwrap());
        let mut reply = text_result("Noted!");
        reply.memories = vec![
            ProposedMemory {
                key: Some("timezone".to_string()),
                value: Some("UTC+2".to_string()),
                context: Some("mentioned it".to_string()),
            },
            ProposedMemory {
                key: None,
                value: None,
                context: None,
            },
        ];
        let engine = orchestrator(db.clone(), Arc::new(RecordingGateway::new(reply)));
        let sink = RecordingSink::default();

        engine
            .handle_incoming_message(&message("I'm in Berlin"), &sink)
            .await;

        let tz = db.get_memory(11, 22, "timezone").await.unwrap().unwrap();
        assert_eq!(tz.value, "UTC+2");
        assert_eq!(tz.context.as_deref(), Some("mentioned it"));
        let misc = db.get_memory(11, 22, "misc").await.unwrap().unwrap();
        assert_eq!(misc.value, "");
    }

    #[tokio::test]
    async fn prompt_uses_memories_persona_and_sanitized_history() {
        let db = Arc::new(BotDatabase::open_in_memory().unwrap());
        db.set_memory(11, 22, "skill_rust", "advanced", None)
            .await
            .unwrap();
        db.set_memory(11, 22, "persona_instructions", "Answer like a pirate.", None)
            .await
            .unwrap();
        db.append_turn(scope(), Role::User, "/memory show").await.unwrap();
        db.append_turn(scope(), Role::User, "I'm writing a ray tracer")
            .await
            .unwrap();
        db.append_turn(scope(), Role::Assistant, "Sick, brrr!")
            .await
            .unwrap();

        let gateway = Arc::new(RecordingGateway::new(text_result("Arr")));
        let engine = orchestrator(db.clone(), gateway.clone());
        engine
            .handle_incoming_message(&message("status?"), &RecordingSink::default())
            .await;

        let prompt = gateway.system_prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("- skill_rust: advanced"));
        assert!(!prompt.contains("- persona_instructions"));
        assert!(prompt.contains("Answer like a pirate."));
        assert!(prompt.contains("Ada: I'm writing a ray tracer"));
        assert!(!prompt.contains("/memory show\n"));
    }

    #[tokio::test]
    async fn empty_mention_becomes_greeting_and_bots_are_flagged() {
        let db = Arc::new(BotDatabase::open_in_memory().unwrap());
        let gateway = Arc::new(RecordingGateway::new(text_result("hey")));
        let engine = orchestrator(db, gateway.clone());

        engine
            .handle_incoming_message(&message("  @BRRR_bot "), &RecordingSink::default())
            .await;
        let mut from_bot = message("@brrr_bot ping");
        from_bot.author_is_bot = true;
        from_bot.author_name = "HelperBot".to_string();
        engine
            .handle_incoming_message(&from_bot, &RecordingSink::default())
            .await;

        let sent = gateway.user_messages.lock().unwrap().clone();
        assert_eq!(sent[0], DEFAULT_GREETING);
        assert_eq!(
            sent[1],
            "[This message is from another bot named HelperBot] ping"
        );
    }

    #[tokio::test]
    async fn gateway_failure_sends_apology_and_writes_nothing() {
        let db = Arc::new(BotDatabase::open_in_memory().unwrap());
        let transport = Arc::new(ScriptedTransport::new(vec![Err(GatewayError::Status {
            status: 500,
            body: "boom".to_string(),
        })]));
        let gateway = Arc::new(LlmClient::new(transport, "primary", "fallback", 256));
        let engine = orchestrator(db.clone(), gateway);
        let sink = RecordingSink::default();

        engine.handle_incoming_message(&message("hi"), &sink).await;

        assert_eq!(sink.messages(), vec![Sent::Reply(ERROR_REPLY.to_string())]);
        assert!(db.get_recent_turns(scope(), 10).await.unwrap().is_empty());
        assert_eq!(
            db.clear_history(HistoryFilter::default()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn long_replies_are_chunked() {
        let db = Arc::new(BotDatabase::open_in_memory().unwrap());
        let long = "x".repeat(3000);
        let engine = orchestrator(db, Arc::new(RecordingGateway::new(text_result(&long))));
        let sink = RecordingSink::default();

        engine.handle_incoming_message(&message("essay"), &sink).await;

        let sent = sink.messages();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Sent::Reply(_)));
        assert_eq!(sent[0].text().len() + sent[1].text().len(), 3000);
    }

    #[tokio::test]
    async fn channel_gate_serializes_same_channel() {
        let gates = Arc::new(ChannelGates::default());
        let guard = gates.acquire(1, 1).await;

        let other_channel = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            gates.acquire(1, 2),
        )
        .await;
        assert!(other_channel.is_ok());

        let same_channel = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            gates.acquire(1, 1),
        )
        .await;
        assert!(same_channel.is_err());

        drop(guard);
        let reacquired = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            gates.acquire(1, 1),
        )
        .await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn idle_channel_gates_are_released() {
        let gates = ChannelGates::default();
        for channel_id in 0..100 {
            drop(gates.acquire(1, channel_id).await);
        }
        assert_eq!(gates.tracked_channels(), 1);

        let held = gates.acquire(2, 1).await;
        drop(gates.acquire(2, 2).await);
        drop(gates.acquire(2, 3).await);
        assert_eq!(gates.tracked_channels(), 2);

        drop(held);
        drop(gates.acquire(3, 1).await);
        assert_eq!(gates.tracked_channels(), 1);
    }

    #[test]
    fn mentions_are_stripped_case_insensitively() {
        let mentions = vec!["@brrr_bot".to_string(), "".to_string()];
        assert_eq!(
            strip_mentions("@Brrr_Bot what's up @brrr_bot", &mentions),
            "what's up"
        );
        assert_eq!(strip_mentions("  plain  ", &[]), "plain");
    }
}
