pub mod agent;
pub mod commands;
pub mod config;
pub mod database;
pub mod domain;
pub mod history;
pub mod llm_client;
pub mod memory;
pub mod runtime;
pub mod telegram;
pub mod tools;
