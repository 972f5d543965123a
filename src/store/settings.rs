use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::write_replacing;

/// Keys are padded to this width when written: `CHAT_ID             = -100123`
const KEY_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    BotToken,
    OwnerId,
    ChatId,
    TypeChat,
    ThreadAlertsId,
    ThreadNewsId,
    ThreadClipsId,
    TelegramChannel,
    Domain,
    TwitchUsername,
    ClientId,
    ClientSecret,
}

impl SettingKey {
    pub const ALL: [SettingKey; 12] = [
        SettingKey::BotToken,
        SettingKey::OwnerId,
        SettingKey::ChatId,
        SettingKey::TypeChat,
        SettingKey::ThreadAlertsId,
        SettingKey::ThreadNewsId,
        SettingKey::ThreadClipsId,
        SettingKey::TelegramChannel,
        SettingKey::Domain,
        SettingKey::TwitchUsername,
        SettingKey::ClientId,
        SettingKey::ClientSecret,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::BotToken => "BOT_TOKEN",
            SettingKey::OwnerId => "OWNER_ID",
            SettingKey::ChatId => "CHAT_ID",
            SettingKey::TypeChat => "TYPE_CHAT",
            SettingKey::ThreadAlertsId => "THREAD_ALERTS_ID",
            SettingKey::ThreadNewsId => "THREAD_NEWS_ID",
            SettingKey::ThreadClipsId => "THREAD_CLIPS_ID",
            SettingKey::TelegramChannel => "TELEGRAM_CHANNEL",
            SettingKey::Domain => "DOMAIN",
            SettingKey::TwitchUsername => "TWITCH_USERNAME",
            SettingKey::ClientId => "CLIENT_ID",
            SettingKey::ClientSecret => "CLIENT_SECRET",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the three things the bot delivers into the target chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feed {
    /// Go-live notifications
    Alerts,
    /// Mirrored channel posts
    News,
    /// New Twitch clips
    Clips,
}

impl Feed {
    pub const ALL: [Feed; 3] = [Feed::Alerts, Feed::News, Feed::Clips];

    pub fn thread_key(&self) -> SettingKey {
        match self {
            Feed::Alerts => SettingKey::ThreadAlertsId,
            Feed::News => SettingKey::ThreadNewsId,
            Feed::Clips => SettingKey::ThreadClipsId,
        }
    }

    /// Slug used in callback ids (`chatsettings:threadnews:on`)
    pub fn slug(&self) -> &'static str {
        match self {
            Feed::Alerts => "alerts",
            Feed::News => "news",
            Feed::Clips => "clips",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.slug() == slug)
    }

    /// Alerts and clips both poll Twitch.
    pub fn needs_twitch(&self) -> bool {
        matches!(self, Feed::Alerts | Feed::Clips)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Feed::Alerts => "Stream alerts",
            Feed::News => "Post forwarding",
            Feed::Clips => "Clip publishing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatKind {
    Group,
    Channel,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Group => "group",
            ChatKind::Channel => "channel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "group" => Some(ChatKind::Group),
            "channel" => Some(ChatKind::Channel),
            _ => None,
        }
    }
}

/// Typed view over the stored key/value pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub bot_token: Option<String>,
    pub owner_id: Option<i64>,
    pub chat_id: Option<i64>,
    pub chat_kind: Option<ChatKind>,
    pub thread_alerts: Option<i32>,
    pub thread_news: Option<i32>,
    pub thread_clips: Option<i32>,
    pub telegram_channel: Option<String>,
    pub domain: Option<String>,
    pub twitch_username: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl Settings {
    pub fn thread(&self, feed: Feed) -> Option<i32> {
        match feed {
            Feed::Alerts => self.thread_alerts,
            Feed::News => self.thread_news,
            Feed::Clips => self.thread_clips,
        }
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.client_id.as_deref()?, self.client_secret.as_deref()?))
    }

    pub fn chat_kind(&self) -> ChatKind {
        self.chat_kind.unwrap_or(ChatKind::Group)
    }

    fn from_values(values: &HashMap<SettingKey, String>) -> Self {
        let text = |key: SettingKey| values.get(&key).cloned();
        let thread = |key: SettingKey| {
            values
                .get(&key)
                .and_then(|v| v.parse::<i32>().ok())
                .filter(|id| *id >= 0)
        };

        Self {
            bot_token: text(SettingKey::BotToken),
            owner_id: values
                .get(&SettingKey::OwnerId)
                .and_then(|v| v.parse().ok()),
            chat_id: values.get(&SettingKey::ChatId).and_then(|v| v.parse().ok()),
            chat_kind: values
                .get(&SettingKey::TypeChat)
                .and_then(|v| ChatKind::parse(v)),
            thread_alerts: thread(SettingKey::ThreadAlertsId),
            thread_news: thread(SettingKey::ThreadNewsId),
            thread_clips: thread(SettingKey::ThreadClipsId),
            telegram_channel: text(SettingKey::TelegramChannel),
            domain: text(SettingKey::Domain),
            twitch_username: text(SettingKey::TwitchUsername),
            client_id: text(SettingKey::ClientId),
            client_secret: text(SettingKey::ClientSecret),
        }
    }
}

/// The `KEY = value` settings file, kept in memory and written through on
/// every change.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    values: HashMap<SettingKey, String>,
}

impl SettingsStore {
    /// Open the store, creating an empty file when none exists yet.
    pub async fn open(path: &Path) -> Result<Self> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Settings file {} not found, creating it", path.display());
                write_replacing(path, "").await?;
                String::new()
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read settings: {}", path.display()))
            }
        };

        let values = content
            .lines()
            .filter_map(parse_line)
            .filter_map(|(name, value)| Some((SettingKey::from_name(name)?, value?.to_string())))
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            values,
        })
    }

    pub fn get(&self, key: SettingKey) -> Option<&str> {
        self.values.get(&key).map(String::as_str)
    }

    pub fn settings(&self) -> Settings {
        Settings::from_values(&self.values)
    }

    /// Set or clear one key and persist immediately.
    pub async fn set(&mut self, key: SettingKey, value: Option<&str>) -> Result<()> {
        self.update(&[(key, value)]).await
    }

    /// Apply several changes in one write.
    pub async fn update(&mut self, changes: &[(SettingKey, Option<&str>)]) -> Result<()> {
        let current = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read settings: {}", self.path.display()))
            }
        };

        let rewritten = rewrite(&current, changes);
        write_replacing(&self.path, &rewritten).await?;

        for (key, value) in changes {
            match normalize(value.unwrap_or_default()) {
                Some(v) => self.values.insert(*key, v.to_string()),
                None => self.values.remove(key),
            };
            debug!("Setting {} updated", key);
        }
        Ok(())
    }
}

/// Treat empty and the JS-era `null`/`undefined` markers as absent.
fn normalize(value: &str) -> Option<&str> {
    let value = value.trim();
    match value {
        "" | "null" | "undefined" | "NaN" => None,
        v => Some(v),
    }
}

/// Split a `KEY = value` line. Comments and blank lines yield `None`.
pub(crate) fn parse_line(line: &str) -> Option<(&str, Option<&str>)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, normalize(value)))
}

pub(crate) fn render_line(key: SettingKey, value: Option<&str>) -> String {
    let line = format!(
        "{:<width$}= {}",
        key.as_str(),
        value.and_then(normalize).unwrap_or_default(),
        width = KEY_WIDTH
    );
    line.trim_end().to_string()
}

/// Replace the lines for the changed keys in place, appending keys that are
/// not present yet. Every other line is kept verbatim.
fn rewrite(content: &str, changes: &[(SettingKey, Option<&str>)]) -> String {
    let mut pending: Vec<(SettingKey, Option<&str>)> = changes.to_vec();
    let mut lines: Vec<String> = Vec::new();

    for line in content.lines() {
        let name = parse_line(line).map(|(name, _)| name);
        let pos = name.and_then(|n| pending.iter().position(|(k, _)| k.as_str() == n));
        match pos {
            Some(i) => {
                let (key, value) = pending.remove(i);
                lines.push(render_line(key, value));
            }
            None => lines.push(line.to_string()),
        }
    }

    for (key, value) in pending {
        lines.push(render_line(key, value));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_pads_key() {
        assert_eq!(
            render_line(SettingKey::ChatId, Some("-100123")),
            "CHAT_ID             = -100123"
        );
        assert_eq!(render_line(SettingKey::Domain, None), "DOMAIN              =");
    }

    #[test]
    fn test_parse_line_variants() {
        assert_eq!(
            parse_line("TWITCH_USERNAME     = streamer"),
            Some(("TWITCH_USERNAME", Some("streamer")))
        );
        assert_eq!(parse_line("THREAD_NEWS_ID=null"), Some(("THREAD_NEWS_ID", None)));
        assert_eq!(parse_line("DOMAIN              ="), Some(("DOMAIN", None)));
        assert_eq!(parse_line("# comment"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("garbage"), None);
    }

    #[test]
    fn test_rewrite_replaces_and_appends() {
        let content = "# bot settings\nCHAT_ID             = 1\nDOMAIN              = a.b\n";
        let out = rewrite(
            content,
            &[
                (SettingKey::ChatId, Some("2")),
                (SettingKey::ThreadNewsId, Some("42")),
            ],
        );
        assert_eq!(
            out,
            "# bot settings\nCHAT_ID             = 2\nDOMAIN              = a.b\nTHREAD_NEWS_ID      = 42\n"
        );
    }

    #[test]
    fn test_thread_ids_must_be_non_negative() {
        let mut values = HashMap::new();
        values.insert(SettingKey::ThreadAlertsId, "0".to_string());
        values.insert(SettingKey::ThreadNewsId, "-5".to_string());
        values.insert(SettingKey::ThreadClipsId, "abc".to_string());
        let settings = Settings::from_values(&values);
        assert_eq!(settings.thread_alerts, Some(0));
        assert_eq!(settings.thread_news, None);
        assert_eq!(settings.thread_clips, None);
    }

    #[tokio::test]
    async fn test_open_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let store = SettingsStore::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.settings(), Settings::default());
    }

    #[tokio::test]
    async fn test_set_is_written_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let mut store = SettingsStore::open(&path).await.unwrap();

        store.set(SettingKey::ChatId, Some("-100777")).await.unwrap();
        store.set(SettingKey::TypeChat, Some("channel")).await.unwrap();
        store.set(SettingKey::ThreadNewsId, Some("42")).await.unwrap();
        store.set(SettingKey::ThreadNewsId, None).await.unwrap();

        let reopened = SettingsStore::open(&path).await.unwrap().settings();
        assert_eq!(reopened.chat_id, Some(-100777));
        assert_eq!(reopened.chat_kind, Some(ChatKind::Channel));
        assert_eq!(reopened.thread_news, None);
        assert_eq!(store.get(SettingKey::ThreadNewsId), None);
    }

    #[tokio::test]
    async fn test_unknown_lines_survive_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        tokio::fs::write(&path, "EXTRA_KEY           = keep me\n")
            .await
            .unwrap();

        let mut store = SettingsStore::open(&path).await.unwrap();
        store
            .set(SettingKey::TwitchUsername, Some("streamer"))
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("EXTRA_KEY           = keep me"));
        assert!(content.contains("TWITCH_USERNAME     = streamer"));
    }

    #[test]
    fn test_feed_slugs_round_trip() {
        for feed in Feed::ALL {
            assert_eq!(Feed::from_slug(feed.slug()), Some(feed));
        }
        assert_eq!(Feed::from_slug("memes"), None);
    }
}
