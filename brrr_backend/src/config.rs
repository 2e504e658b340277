use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token from @BotFather. The adapter stays off without one.
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Empty means every chat may talk to the bot.
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
    #[serde(default = "default_trigger_word")]
    pub trigger_word: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            allowed_chat_ids: Vec::new(),
            trigger_word: default_trigger_word(),
        }
    }
}

impl TelegramConfig {
    pub fn token(&self) -> Option<&str> {
        self.bot_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    pub fn allows_chat(&self, chat_id: i64) -> bool {
        self.allowed_chat_ids.is_empty() || self.allowed_chat_ids.contains(&chat_id)
    }
}

fn default_trigger_word() -> String {
    "brrr".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_bot_name")]
    pub bot_name: String,

    // LLM configuration (OpenAI-compatible chat completions)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    /// Model used for the single retry after a truncated empty reply.
    #[serde(default = "default_llm_fallback_model")]
    pub llm_fallback_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_retry_max_tokens")]
    pub retry_max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // Conversation history
    #[serde(default = "default_history_fetch_limit")]
    pub history_fetch_limit: usize,
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: i64,
    #[serde(default = "default_prune_interval_mins")]
    pub prune_interval_mins: u64,

    /// Longest single outbound message; longer replies are split.
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default)]
    pub telegram: TelegramConfig,
}

fn default_bot_name() -> String {
    "BRRR Bot".to_string()
}

fn default_llm_url() -> String {
    "https://router.requesty.ai/v1".to_string()
}

fn default_llm_model() -> String {
    "openai/gpt-5-nano".to_string()
}

fn default_llm_fallback_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    12000
}

fn default_retry_max_tokens() -> u32 {
    256
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_history_fetch_limit() -> usize {
    10
}

fn default_history_retention_days() -> i64 {
    7
}

fn default_prune_interval_mins() -> u64 {
    360
}

fn default_max_message_chars() -> usize {
    2000
}

fn default_database_path() -> String {
    "data/brrr.db".to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_name: default_bot_name(),
            llm_api_url: default_llm_url(),
            llm_api_key: None,
            llm_model: default_llm_model(),
            llm_fallback_model: default_llm_fallback_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            retry_max_tokens: default_retry_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            history_fetch_limit: default_history_fetch_limit(),
            history_retention_days: default_history_retention_days(),
            prune_interval_mins: default_prune_interval_mins(),
            max_message_chars: default_max_message_chars(),
            database_path: default_database_path(),
            telegram: TelegramConfig::default(),
        }
    }
}

impl BotConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("brrr_config.toml")
    }

    /// Load brrr_config.toml (next to the executable) or defaults, then apply
    /// environment overrides.
    pub fn load() -> Self {
        let path = Self::config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_toml(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {:#}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };
        config.apply_env();
        config
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Invalid brrr_config.toml")
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|name| env::var(name).ok());
    }

    /// Overlay environment variables using the given lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(name) = var("BRRR_BOT_NAME") {
            self.bot_name = name;
        }

        if let Some(url) = var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Some(key) = var("LLM_API_KEY").or_else(|| var("REQUESTY_API_KEY")) {
            self.llm_api_key = Some(key);
        }

        if let Some(model) = var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Some(model) = var("LLM_FALLBACK_MODEL") {
            self.llm_fallback_model = model;
        }

        if let Some(timeout) = var("LLM_TIMEOUT_SECS") {
            match timeout.trim().parse() {
                Ok(secs) => self.request_timeout_secs = secs,
                Err(_) => tracing::warn!("Ignoring invalid LLM_TIMEOUT_SECS '{}'", timeout),
            }
        }

        if let Some(days) = var("HISTORY_RETENTION_DAYS") {
            match days.trim().parse() {
                Ok(days) => self.history_retention_days = days,
                Err(_) => tracing::warn!("Ignoring invalid HISTORY_RETENTION_DAYS '{}'", days),
            }
        }

        if let Some(path) = var("DATABASE_PATH") {
            self.database_path = path;
        }

        if let Some(token) = var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
        }

        if let Some(chat_id) = var("TELEGRAM_CHAT_ID") {
            match chat_id.trim().parse::<i64>() {
                Ok(id) if !self.telegram.allowed_chat_ids.contains(&id) => {
                    self.telegram.allowed_chat_ids.push(id)
                }
                Ok(_) => {}
                Err(_) => tracing::warn!("Ignoring invalid TELEGRAM_CHAT_ID '{}'", chat_id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = BotConfig::from_toml("").unwrap();
        assert_eq!(config.bot_name, "BRRR Bot");
        assert_eq!(config.llm_model, "openai/gpt-5-nano");
        assert_eq!(config.llm_fallback_model, "openai/gpt-4o-mini");
        assert_eq!(config.max_tokens, 12000);
        assert_eq!(config.retry_max_tokens, 256);
        assert_eq!(config.max_message_chars, 2000);
        assert_eq!(config.telegram.trigger_word, "brrr");
        assert!(config.telegram.token().is_none());
        assert!(config.telegram.allows_chat(-1001));
    }

    #[test]
    fn toml_overrides_nested_sections() {
        let config = BotConfig::from_toml(
            r#"
            bot_name = "Turbo"
            llm_fallback_model = "local/llama"
            history_fetch_limit = 20

            [telegram]
            bot_token = "123:abc"
            allowed_chat_ids = [-1001, 42]
            "#,
        )
        .unwrap();
        assert_eq!(config.bot_name, "Turbo");
        assert_eq!(config.llm_fallback_model, "local/llama");
        assert_eq!(config.history_fetch_limit, 20);
        assert_eq!(config.telegram.token(), Some("123:abc"));
        assert!(config.telegram.allows_chat(42));
        assert!(!config.telegram.allows_chat(7));
    }

    #[test]
    fn env_overrides_apply_over_file_values() {
        let mut config = BotConfig::default();
        config.apply_env_with(lookup(&[
            ("REQUESTY_API_KEY", "rq-key"),
            ("LLM_FALLBACK_MODEL", "openai/gpt-4.1-mini"),
            ("LLM_TIMEOUT_SECS", "15"),
            ("TELEGRAM_CHAT_ID", "-100123"),
            ("DATABASE_PATH", "/tmp/brrr.db"),
        ]));
        assert_eq!(config.llm_api_key.as_deref(), Some("rq-key"));
        assert_eq!(config.llm_fallback_model, "openai/gpt-4.1-mini");
        assert_eq!(config.request_timeout_secs, 15);
        assert_eq!(config.telegram.allowed_chat_ids, vec![-100123]);
        assert_eq!(config.database_path, "/tmp/brrr.db");
    }

    #[test]
    fn primary_key_wins_and_bad_numbers_are_ignored() {
        let mut config = BotConfig::default();
        config.apply_env_with(lookup(&[
            ("LLM_API_KEY", "primary"),
            ("REQUESTY_API_KEY", "secondary"),
            ("LLM_TIMEOUT_SECS", "soon"),
            ("LLM_MODEL", "  "),
        ]));
        assert_eq!(config.llm_api_key.as_deref(), Some("primary"));
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.llm_model, "openai/gpt-5-nano");
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(BotConfig::from_toml("max_tokens = \"lots\"").is_err());
    }
}
