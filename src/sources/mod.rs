pub mod rss;
pub mod twitch;

use anyhow::Result;
use async_trait::async_trait;

pub use twitch::{Clip, TwitchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub url: String,
}

impl MediaItem {
    pub fn photo(url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Photo,
            url: url.into(),
        }
    }

    pub fn video(url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Video,
            url: url.into(),
        }
    }
}

/// The latest post of a mirrored channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub link: String,
    /// Videos first, then images, each in document order
    pub media: Vec<MediaItem>,
    /// HTML-safe text with the source footer already appended
    pub text: String,
}

impl Post {
    /// Numeric id taken from the last path segment of the link
    /// (`https://t.me/channel/1234` → 1234).
    pub fn id(&self) -> Option<u64> {
        rss::post_id_from_link(&self.link)
    }
}

/// Where new channel posts come from.
#[async_trait]
pub trait PostSource: Send + Sync {
    /// Fetch the latest post of `channel` through the proxy at `domain`.
    /// `Ok(None)` means the feed is empty.
    async fn latest_post(&self, channel: &str, domain: &str) -> Result<Option<Post>>;
}

/// Twitch queries used by the alert and clip loops.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn access_token(&self, client_id: &str, client_secret: &str)
        -> Result<String, TwitchError>;

    async fn user_id(
        &self,
        login: &str,
        client_id: &str,
        token: &str,
    ) -> Result<Option<String>, TwitchError>;

    /// `Err` is "unknown", distinct from "offline".
    async fn is_live(&self, user_id: &str, client_id: &str, token: &str)
        -> Result<bool, TwitchError>;

    async fn latest_clip(
        &self,
        user_id: &str,
        client_id: &str,
        token: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Clip>, TwitchError>;
}
