use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-level configuration loaded from `config.toml`.
///
/// Everything the owner edits at runtime lives in the settings store instead;
/// this file only carries paths, intervals and upstream endpoints.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub rss: RssConfig,
    #[serde(default)]
    pub twitch: TwitchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    /// Fallback source for `BOT_TOKEN` on first launch
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_news_interval")]
    pub news_interval_secs: u64,
    #[serde(default = "default_alerts_interval")]
    pub alerts_interval_secs: u64,
    #[serde(default = "default_clips_interval")]
    pub clips_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RssConfig {
    #[serde(default = "default_rss_domain")]
    pub default_domain: String,
    #[serde(default = "default_rss_scheme")]
    pub scheme: String,
    #[serde(default = "default_cache_timeout")]
    pub cache_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TwitchConfig {
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_helix_url")]
    pub helix_url: String,
    #[serde(default = "default_clip_lookback")]
    pub clip_lookback_hours: i64,
}

fn default_settings_file() -> PathBuf {
    PathBuf::from(".env")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/others")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_token_file() -> PathBuf {
    PathBuf::from("token.txt")
}

fn default_news_interval() -> u64 {
    60
}

fn default_alerts_interval() -> u64 {
    60
}

fn default_clips_interval() -> u64 {
    120
}

fn default_rss_domain() -> String {
    "rss-bridge.org/bridge01".to_string()
}

fn default_rss_scheme() -> String {
    "http".to_string()
}

fn default_cache_timeout() -> u64 {
    60
}

fn default_auth_url() -> String {
    "https://id.twitch.tv/oauth2/token".to_string()
}

fn default_helix_url() -> String {
    "https://api.twitch.tv/helix".to_string()
}

fn default_clip_lookback() -> i64 {
    24
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            settings_file: default_settings_file(),
            data_dir: default_data_dir(),
            logs_dir: default_logs_dir(),
            token_file: default_token_file(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            news_interval_secs: default_news_interval(),
            alerts_interval_secs: default_alerts_interval(),
            clips_interval_secs: default_clips_interval(),
        }
    }
}

impl Default for RssConfig {
    fn default() -> Self {
        Self {
            default_domain: default_rss_domain(),
            scheme: default_rss_scheme(),
            cache_timeout_secs: default_cache_timeout(),
        }
    }
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            helix_url: default_helix_url(),
            clip_lookback_hours: default_clip_lookback(),
        }
    }
}

impl PollingConfig {
    pub fn news_interval(&self) -> Duration {
        Duration::from_secs(self.news_interval_secs.max(1))
    }

    pub fn alerts_interval(&self) -> Duration {
        Duration::from_secs(self.alerts_interval_secs.max(1))
    }

    pub fn clips_interval(&self) -> Duration {
        Duration::from_secs(self.clips_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from `path`. A missing file is not an error: the
    /// bot runs on defaults and is configured through the chat menu.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}
