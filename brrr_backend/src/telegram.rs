//! Telegram bot integration for BRRR.
//!
//! When a bot token is configured, spawns a long-polling tokio task that:
//! - Resolves the bot's own identity with `getMe`.
//! - Routes slash commands to the [`CommandHandler`].
//! - Hands every other message the bot should answer to the turn engine,
//!   one task per message.
//!
//! `allowed_chat_ids` (or `TELEGRAM_CHAT_ID`) restricts the bot to specific chats.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::agent::reply::{deliver, ReplySink};
use crate::agent::{IncomingMessage, TurnOrchestrator};
use crate::commands::CommandHandler;
use crate::config::{BotConfig, TelegramConfig};
use crate::history::ConversationScope;

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    /// Unix seconds.
    date: i64,
    chat: TelegramChat,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message_thread_id: Option<i64>,
    #[serde(default)]
    reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    chat_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TelegramUser {
    id: i64,
    is_bot: bool,
    first_name: String,
    #[serde(default)]
    username: Option<String>,
}

impl TelegramUser {
    fn display_name(&self) -> String {
        match self.username.as_deref() {
            Some(username) if self.first_name.trim().is_empty() => username.to_string(),
            _ => self.first_name.clone(),
        }
    }
}

/// Who the bot is, as reported by `getMe`.
#[derive(Debug, Clone)]
struct BotIdentity {
    id: i64,
    username: String,
}

impl BotIdentity {
    fn mention(&self) -> String {
        format!("@{}", self.username)
    }
}

// ─── Public entry point ───────────────────────────────────────────────────────

struct TelegramBot {
    client: reqwest::Client,
    api_base: String,
    identity: BotIdentity,
    telegram: TelegramConfig,
    max_message_chars: usize,
    orchestrator: Arc<TurnOrchestrator>,
    commands: Arc<CommandHandler>,
}

/// Spawn the Telegram bot task if a bot token is configured.
/// Returns `None` (and spawns nothing) without one.
pub fn spawn_telegram_bot(
    config: &BotConfig,
    orchestrator: Arc<TurnOrchestrator>,
    commands: Arc<CommandHandler>,
) -> Option<tokio::task::JoinHandle<()>> {
    let token = config.telegram.token()?.to_string();
    let telegram = config.telegram.clone();
    let max_message_chars = config.max_message_chars;

    Some(tokio::spawn(async move {
        let client = reqwest::Client::new();
        let api_base = format!("https://api.telegram.org/bot{}", token);

        let identity = match get_me(&client, &api_base).await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::error!("Telegram: could not resolve bot identity: {:#}", e);
                return;
            }
        };
        tracing::info!(
            "Telegram bot @{} active (allowed chats: {:?})",
            identity.username,
            telegram.allowed_chat_ids
        );

        let bot = Arc::new(TelegramBot {
            client,
            api_base,
            identity,
            telegram,
            max_message_chars,
            orchestrator,
            commands,
        });
        run_bot(bot).await;
    }))
}

// ─── Bot loop ─────────────────────────────────────────────────────────────────

async fn run_bot(bot: Arc<TelegramBot>) {
    let started_at = chrono::Utc::now().timestamp();
    let mut offset: i64 = 0;

    loop {
        let updates = match poll_updates(&bot.client, &bot.api_base, offset).await {
            Some(u) => u,
            None => continue,
        };

        for update in updates {
            offset = update.update_id + 1;

            let msg = match update.message {
                Some(m) => m,
                None => continue,
            };

            if msg.date < started_at {
                tracing::debug!("Telegram: skipping message sent before startup");
                continue;
            }

            let chat_id = msg.chat.id;
            if !bot.telegram.allows_chat(chat_id) {
                tracing::debug!(
                    "Telegram: ignoring message from unauthorized chat {}",
                    chat_id
                );
                continue;
            }

            let Some(incoming) = to_incoming(&msg, &bot.identity) else {
                continue;
            };

            let bot = bot.clone();
            tokio::spawn(async move {
                handle_message(bot, msg, incoming).await;
            });
        }
    }
}

async fn handle_message(bot: Arc<TelegramBot>, msg: TelegramMessage, incoming: IncomingMessage) {
    let sink = TelegramSink {
        client: bot.client.clone(),
        api_base: bot.api_base.clone(),
        chat_id: msg.chat.id,
        reply_to: msg.message_id,
        thread_id: msg.message_thread_id,
    };

    match bot.commands.handle(&incoming).await {
        Ok(Some(response)) => {
            if let Err(e) = deliver(&sink, &response, bot.max_message_chars).await {
                tracing::error!("Telegram: failed to send command response: {:#}", e);
            }
            return;
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!("Telegram: command failed: {:#}", e);
            if let Err(e) = sink.reply(crate::agent::reply::ERROR_REPLY).await {
                tracing::error!("Telegram: failed to send error reply: {:#}", e);
            }
            return;
        }
    }

    if !should_engage(&msg, &bot.identity, &bot.telegram.trigger_word) {
        return;
    }

    tracing::info!(
        "Telegram [chat {}] {}: {:?}",
        msg.chat.id,
        incoming.author_name,
        incoming.text
    );
    bot.orchestrator
        .handle_incoming_message(&incoming, &sink)
        .await;
}

// ─── Routing ─────────────────────────────────────────────────────────────────

/// Map a Telegram message onto a conversation. `None` for messages the bot
/// never handles: its own, anonymous ones and non-text ones.
fn to_incoming(msg: &TelegramMessage, identity: &BotIdentity) -> Option<IncomingMessage> {
    let from = msg.from.as_ref()?;
    if from.id == identity.id {
        return None;
    }
    let text = msg.text.as_deref().map(str::trim).filter(|t| !t.is_empty())?;

    Some(IncomingMessage {
        scope: ConversationScope {
            user_id: from.id,
            community_id: msg.chat.id,
            // Forum topics are separate conversations
            channel_id: msg.message_thread_id.unwrap_or(msg.chat.id),
        },
        author_name: from.display_name(),
        author_is_bot: from.is_bot,
        text: text.to_string(),
        mentions: vec![identity.mention()],
    })
}

/// Private chats always engage. In groups the bot answers when mentioned,
/// replied to, or when the trigger word appears.
fn should_engage(msg: &TelegramMessage, identity: &BotIdentity, trigger_word: &str) -> bool {
    if msg.chat.chat_type == "private" {
        return true;
    }
    let text = msg.text.as_deref().unwrap_or("").to_lowercase();

    if text.contains(&identity.mention().to_lowercase()) {
        return true;
    }

    let replied_to_bot = msg
        .reply_to_message
        .as_ref()
        .and_then(|reply| reply.from.as_ref())
        .is_some_and(|author| author.id == identity.id);
    if replied_to_bot {
        return true;
    }

    let trigger = trigger_word.trim().to_lowercase();
    !trigger.is_empty() && text.contains(&trigger)
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn get_me(client: &reqwest::Client, api_base: &str) -> Result<BotIdentity> {
    let url = format!("{}/getMe", api_base);
    let body: TelegramResponse<TelegramUser> = client
        .get(&url)
        .send()
        .await
        .context("getMe request failed")?
        .json()
        .await
        .context("getMe returned an unreadable body")?;

    match body.result {
        Some(user) if body.ok => Ok(BotIdentity {
            id: user.id,
            username: user.username.unwrap_or(user.first_name),
        }),
        _ => bail!(
            "getMe rejected: {}",
            body.description.unwrap_or_else(|| "no description".to_string())
        ),
    }
}

async fn poll_updates(
    client: &reqwest::Client,
    api_base: &str,
    offset: i64,
) -> Option<Vec<Update>> {
    let url = format!("{}/getUpdates", api_base);
    let params = serde_json::json!({
        "offset": offset,
        "timeout": 30,
        "allowed_updates": ["message"]
    });

    let resp = match client.post(&url).json(&params).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("Telegram getUpdates error: {}", e);
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            return None;
        }
    };

    let body: TelegramResponse<Vec<Update>> = match resp.json().await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Telegram getUpdates parse error: {}", e);
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            return None;
        }
    };

    if !body.ok {
        tracing::warn!(
            "Telegram API returned ok=false: {}",
            body.description.as_deref().unwrap_or("")
        );
        tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
        return None;
    }

    Some(body.result.unwrap_or_default())
}

/// Sends replies into the chat (and forum topic) a message came from.
struct TelegramSink {
    client: reqwest::Client,
    api_base: String,
    chat_id: i64,
    reply_to: i64,
    thread_id: Option<i64>,
}

impl TelegramSink {
    async fn send_message(&self, text: &str, reply_to: Option<i64>) -> Result<()> {
        let url = format!("{}/sendMessage", self.api_base);
        let mut payload = serde_json::json!({ "chat_id": self.chat_id, "text": text });
        if let Some(thread_id) = self.thread_id {
            payload["message_thread_id"] = thread_id.into();
        }
        if let Some(message_id) = reply_to {
            payload["reply_to_message_id"] = message_id.into();
            payload["allow_sending_without_reply"] = true.into();
        }

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("sendMessage request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("sendMessage failed: HTTP {} {}", status, body);
        }
        tracing::debug!("Telegram: sent message to chat {}", self.chat_id);
        Ok(())
    }
}

#[async_trait]
impl ReplySink for TelegramSink {
    async fn reply(&self, text: &str) -> Result<()> {
        self.send_message(text, Some(self.reply_to)).await
    }

    async fn send(&self, text: &str) -> Result<()> {
        self.send_message(text, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> BotIdentity {
        BotIdentity {
            id: 999,
            username: "brrr_bot".to_string(),
        }
    }

    fn parse(value: serde_json::Value) -> TelegramMessage {
        serde_json::from_value(value).unwrap()
    }

    fn group_message(text: &str) -> TelegramMessage {
        parse(json!({
            "message_id": 10,
            "date": 1_700_000_000,
            "chat": {"id": -100, "type": "supergroup"},
            "from": {"id": 42, "is_bot": false, "first_name": "Ada", "username": "ada"},
            "text": text
        }))
    }

    #[test]
    fn group_messages_need_mention_reply_or_trigger() {
        let me = identity();
        assert!(!should_engage(&group_message("anyone around?"), &me, "brrr"));
        assert!(should_engage(&group_message("@Brrr_Bot hi"), &me, "brrr"));
        assert!(should_engage(&group_message("make it go BRRR"), &me, "brrr"));
        assert!(!should_engage(&group_message("make it go brrr"), &me, ""));

        let reply = parse(json!({
            "message_id": 11,
            "date": 1_700_000_000,
            "chat": {"id": -100, "type": "supergroup"},
            "from": {"id": 42, "is_bot": false, "first_name": "Ada"},
            "text": "thanks",
            "reply_to_message": {
                "message_id": 9,
                "date": 1_700_000_000,
                "chat": {"id": -100, "type": "supergroup"},
                "from": {"id": 999, "is_bot": true, "first_name": "BRRR", "username": "brrr_bot"},
                "text": "done!"
            }
        }));
        assert!(should_engage(&reply, &me, "brrr"));
    }

    #[test]
    fn private_chats_always_engage() {
        let msg = parse(json!({
            "message_id": 1,
            "date": 1_700_000_000,
            "chat": {"id": 42, "type": "private"},
            "from": {"id": 42, "is_bot": false, "first_name": "Ada"},
            "text": "hello"
        }));
        assert!(should_engage(&msg, &identity(), "brrr"));
    }

    #[test]
    fn forum_topics_map_to_their_own_channel() {
        let mut msg = group_message("@brrr_bot status");
        let incoming = to_incoming(&msg, &identity()).unwrap();
        assert_eq!(incoming.scope.community_id, -100);
        assert_eq!(incoming.scope.channel_id, -100);
        assert_eq!(incoming.scope.user_id, 42);
        assert_eq!(incoming.mentions, vec!["@brrr_bot".to_string()]);

        msg.message_thread_id = Some(77);
        let incoming = to_incoming(&msg, &identity()).unwrap();
        assert_eq!(incoming.scope.channel_id, 77);
    }

    #[test]
    fn own_and_empty_messages_are_dropped() {
        let mut own = group_message("echo");
        if let Some(from) = own.from.as_mut() {
            from.id = 999;
        }
        assert!(to_incoming(&own, &identity()).is_none());
        assert!(to_incoming(&group_message("   "), &identity()).is_none());
    }

    #[test]
    fn other_bots_are_flagged() {
        let msg = parse(json!({
            "message_id": 1,
            "date": 1_700_000_000,
            "chat": {"id": -100, "type": "group"},
            "from": {"id": 5, "is_bot": true, "first_name": "HelperBot"},
            "text": "@brrr_bot ping"
        }));
        let incoming = to_incoming(&msg, &identity()).unwrap();
        assert!(incoming.author_is_bot);
        assert_eq!(incoming.author_name, "HelperBot");
    }
}
