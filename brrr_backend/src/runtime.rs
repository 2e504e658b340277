use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;

use crate::agent::{TurnOrchestrator, TurnSettings};
use crate::commands::CommandHandler;
use crate::config::BotConfig;
use crate::database::BotDatabase;
use crate::history::HistoryStore;
use crate::llm_client::{LlmClient, ModelGateway};
use crate::tools::ToolRegistry;

pub struct BotRuntime {
    pub config: BotConfig,
    pub database: Arc<BotDatabase>,
    pub tool_registry: Arc<ToolRegistry>,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub commands: Arc<CommandHandler>,
}

pub struct BotRuntimeBuilder {
    config: BotConfig,
    database: Option<Arc<BotDatabase>>,
    gateway: Option<Arc<dyn ModelGateway>>,
}

impl BotRuntimeBuilder {
    pub fn new(config: BotConfig) -> Self {
        Self {
            config,
            database: None,
            gateway: None,
        }
    }

    /// Use an already-open database instead of `config.database_path`.
    pub fn with_database(mut self, database: Arc<BotDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    /// Use a custom model gateway instead of the configured HTTP provider.
    pub fn with_gateway(mut self, gateway: Arc<dyn ModelGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn build(self) -> Result<BotRuntime> {
        let config = self.config;

        let database = match self.database {
            Some(db) => db,
            None => Arc::new(
                BotDatabase::new(&config.database_path).with_context(|| {
                    format!("Failed to open database at {}", config.database_path)
                })?,
            ),
        };

        let tool_registry = Arc::new(ToolRegistry::with_builtin_tools(database.clone())?);
        tracing::info!(
            "Tool registry initialized with {} built-in tools: {:?}",
            tool_registry.len(),
            tool_registry.names()
        );

        let gateway: Arc<dyn ModelGateway> = match self.gateway {
            Some(gateway) => gateway,
            None => {
                let client = LlmClient::from_config(&config)?;
                tracing::info!(
                    "LLM gateway: {} (model {}, fallback {})",
                    config.llm_api_url,
                    client.model(),
                    config.llm_fallback_model
                );
                Arc::new(client)
            }
        };

        let orchestrator = Arc::new(TurnOrchestrator::new(
            database.clone(),
            database.clone(),
            gateway,
            tool_registry.clone(),
            TurnSettings::from(&config),
        ));
        let commands = Arc::new(CommandHandler::new(
            database.clone(),
            database.clone(),
            database.clone(),
        ));

        Ok(BotRuntime {
            config,
            database,
            tool_registry,
            orchestrator,
            commands,
        })
    }
}

impl BotRuntime {
    pub fn bootstrap(config: BotConfig) -> Result<Self> {
        BotRuntimeBuilder::new(config).build()
    }

    /// Start the Telegram adapter when a bot token is configured.
    pub fn spawn_telegram(&self) -> Option<JoinHandle<()>> {
        let handle = crate::telegram::spawn_telegram_bot(
            &self.config,
            self.orchestrator.clone(),
            self.commands.clone(),
        );
        if handle.is_none() {
            tracing::warn!("No Telegram bot token configured; chat adapter disabled");
        }
        handle
    }

    /// Periodically delete turns older than the retention window.
    pub fn spawn_history_pruner(&self) -> JoinHandle<()> {
        let history: Arc<dyn HistoryStore> = self.database.clone();
        let retention_days = self.config.history_retention_days;
        let period = Duration::from_secs(self.config.prune_interval_mins.max(1) * 60);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = prune_history(history.as_ref(), retention_days).await {
                    tracing::error!("History pruning failed: {:#}", e);
                }
            }
        })
    }
}

/// Delete turns older than `retention_days`. Returns the number removed.
pub async fn prune_history(history: &dyn HistoryStore, retention_days: i64) -> Result<usize> {
    let cutoff = chrono::Duration::try_days(retention_days.max(0))
        .and_then(|retention| Utc::now().checked_sub_signed(retention));
    let Some(cutoff) = cutoff else {
        tracing::warn!(
            "History retention of {} days reaches past the earliest timestamp; nothing pruned",
            retention_days
        );
        return Ok(0);
    };
    let removed = history.prune_older_than(cutoff).await?;
    if removed > 0 {
        tracing::info!(
            "Pruned {} conversation turns older than {} days",
            removed,
            retention_days
        );
    }
    Ok(removed)
}
