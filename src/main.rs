mod app;
mod config;
mod logging;
mod menu;
mod platform;
mod scheduler;
mod session;
mod sources;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::Bot;
use tracing::info;

use crate::app::AppState;
use crate::config::Config;
use crate::platform::telegram::{self, TelegramNotifier};
use crate::sources::rss::RssBridgeClient;
use crate::sources::twitch::TwitchClient;
use crate::store::SettingsStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Initialize logging
    let _log_guard = logging::init(&config.storage.logs_dir)?;

    info!("Configuration loaded from: {}", config_path.display());
    info!("  Settings: {}", config.storage.settings_file.display());
    info!("  Data: {}", config.storage.data_dir.display());
    info!(
        "  Polling: news {}s, alerts {}s, clips {}s",
        config.polling.news_interval_secs,
        config.polling.alerts_interval_secs,
        config.polling.clips_interval_secs
    );

    let mut store = SettingsStore::open(&config.storage.settings_file).await?;
    let Some(token) = telegram::bootstrap_token(&mut store, &config.storage.token_file).await?
    else {
        return Ok(());
    };

    let bot = Bot::new(token);
    let state = AppState::new(
        config.clone(),
        store,
        Arc::new(RssBridgeClient::new(&config.rss)),
        Arc::new(TwitchClient::new(&config.twitch)),
        Arc::new(TelegramNotifier::new(bot.clone())),
    )
    .await?;

    // Run the Telegram bot
    info!("Bot is starting...");
    telegram::run(bot, state).await?;

    Ok(())
}
