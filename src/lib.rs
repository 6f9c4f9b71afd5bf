pub mod activation;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod health;
pub mod moderation;
pub mod normalization;
pub mod page;
pub mod scheduler;
pub mod settings;
pub mod statistics;
pub mod triggers;

#[cfg(test)]
mod scenario_test;

pub use commands::{Command, CommandResponse};
pub use config::{Config, ModerationMode, Settings};
pub use engine::AutoMod;
pub use moderation::api::{HttpModerationClient, ModerationEndpoint};
pub use moderation::{ModerationError, ModerationOutcome};
pub use page::memory::MemoryPage;
pub use page::ChatPage;
pub use settings::{MemorySettingsStore, SettingsStore};
pub use statistics::{StatEvent, StatisticsCollector};
pub use triggers::TriggerSet;
