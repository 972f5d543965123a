use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::debug;

use super::{MediaItem, Post, PostSource};
use crate::config::RssConfig;

static RE_VIDEO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<video\s+[^>]*src=["']([^"']+)["'][^>]*>"#).unwrap());
static RE_VIDEO_SOURCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<source\s+src=["']([^"']*?)["'] type=["']video/mp4["']>"#).unwrap()
});
static RE_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<img\s+[^>]*src=["']([^"']+)["'][^>]*>"#).unwrap());
static RE_BR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<br\s*/?>").unwrap());
static RE_MESSAGE_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<div\sclass="tgme_widget_message_text\sjs-message_text"\sdir="auto">.*?</div>"#)
        .unwrap()
});
static RE_DIV: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?div.*?>").unwrap());
static RE_EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"</?(?:i|b)(?:\sclass="emoji".*?)?>"#).unwrap());
static RE_ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)</?.*?>").unwrap());

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    items: Vec<FeedItem>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content_html: Option<String>,
}

/// Reads a public Telegram channel through an RSS-bridge instance
/// (`TelegramBridge`, JSON output).
pub struct RssBridgeClient {
    client: reqwest::Client,
    scheme: String,
    cache_timeout_secs: u64,
}

impl RssBridgeClient {
    pub fn new(config: &RssConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            scheme: config.scheme.clone(),
            cache_timeout_secs: config.cache_timeout_secs,
        }
    }
}

#[async_trait]
impl PostSource for RssBridgeClient {
    async fn latest_post(&self, channel: &str, domain: &str) -> Result<Option<Post>> {
        let name = channel.trim_start_matches('@');
        if name.is_empty() {
            anyhow::bail!("Channel name is not set");
        }

        let url = format!("{}://{}/", self.scheme, domain.trim_end_matches('/'));
        let cache_timeout = self.cache_timeout_secs.to_string();
        debug!("Fetching latest post of @{} from {}", name, url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("action", "display"),
                ("username", name),
                ("bridge", "TelegramBridge"),
                ("_cache_timeout", cache_timeout.as_str()),
                ("format", "Json"),
            ])
            .send()
            .await
            .with_context(|| format!("Failed to reach RSS-bridge at {}", domain))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("RSS-bridge error ({}): {}", status, body);
        }

        let feed: FeedResponse = response
            .json()
            .await
            .context("Failed to parse RSS-bridge response")?;

        Ok(feed.items.into_iter().next().map(|item| {
            let html = item.content_html.unwrap_or_default();
            let link = item.url.unwrap_or_default();
            Post {
                media: extract_media(&html),
                text: extract_text(&html, &link),
                link,
            }
        }))
    }
}

/// Collect embedded media: `<video src>`, then `<source type="video/mp4">`,
/// then `<img src>`, each in encounter order.
pub fn extract_media(html: &str) -> Vec<MediaItem> {
    let videos = RE_VIDEO
        .captures_iter(html)
        .chain(RE_VIDEO_SOURCE.captures_iter(html))
        .map(|c| MediaItem::video(&c[1]));
    let images = RE_IMAGE.captures_iter(html).map(|c| MediaItem::photo(&c[1]));
    videos.chain(images).collect()
}

/// Extract the post text. Prefers the rendered message-text block with
/// its `div` wrappers and `i`/`b`/emoji tags removed; otherwise strips every
/// tag from the payload. Appends a source footer when `link` is known.
pub fn extract_text(html: &str, link: &str) -> String {
    let html = RE_BR.replace_all(html, "\n");

    let blocks: Vec<String> = RE_MESSAGE_TEXT
        .find_iter(&html)
        .map(|m| {
            let without_div = RE_DIV.replace_all(m.as_str(), "");
            RE_EMPHASIS.replace_all(&without_div, "").into_owned()
        })
        .collect();

    let mut text = if blocks.is_empty() {
        RE_ANY_TAG.replace_all(&html, "").into_owned()
    } else {
        blocks.join("\n")
    };

    if !link.is_empty() {
        text.push_str(&format!("\n\n🔗 Source: {}", link));
    }
    text
}

/// Trailing numeric path segment of a post link.
pub fn post_id_from_link(link: &str) -> Option<u64> {
    let path = link.split(['?', '#']).next().unwrap_or_default();
    path.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MediaKind;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const POST_HTML: &str = concat!(
        r#"<div class="tgme_widget_message_bubble">"#,
        r#"<img src="https://cdn.example/a.jpg" alt="">"#,
        r#"<video class="tgme_video" src="https://cdn.example/v1.mp4" width="320"></video>"#,
        r#"<img class="x" src='https://cdn.example/b.jpg'>"#,
        r#"<video><source src="https://cdn.example/v2.mp4" type="video/mp4"></video>"#,
        r#"<div class="tgme_widget_message_text js-message_text" dir="auto">"#,
        r#"Big <b>news</b><br/>today <i class="emoji" style="x"><b>🔥</b></i> <a href="https://x.y">link</a>"#,
        r#"</div></div>"#,
    );

    #[test]
    fn test_media_videos_before_images_in_order() {
        let media = extract_media(POST_HTML);
        assert_eq!(
            media,
            vec![
                MediaItem::video("https://cdn.example/v1.mp4"),
                MediaItem::video("https://cdn.example/v2.mp4"),
                MediaItem::photo("https://cdn.example/a.jpg"),
                MediaItem::photo("https://cdn.example/b.jpg"),
            ]
        );
        assert_eq!(media[0].kind, MediaKind::Video);
    }

    #[test]
    fn test_media_absent() {
        assert!(extract_media("<p>just text</p>").is_empty());
    }

    #[test]
    fn test_text_prefers_message_block() {
        let text = extract_text(POST_HTML, "https://t.me/chan/10");
        assert_eq!(
            text,
            "Big news\ntoday 🔥 <a href=\"https://x.y\">link</a>\n\n🔗 Source: https://t.me/chan/10"
        );
    }

    #[test]
    fn test_text_falls_back_to_stripped_payload() {
        let text = extract_text("<p>Hello<br>world</p><span>!</span>", "");
        assert_eq!(text, "Hello\nworld!");
    }

    #[test]
    fn test_post_id_from_link() {
        assert_eq!(post_id_from_link("https://t.me/chan/1234"), Some(1234));
        assert_eq!(post_id_from_link("https://t.me/chan/1234/"), Some(1234));
        assert_eq!(post_id_from_link("https://t.me/chan/1234?single"), Some(1234));
        assert_eq!(post_id_from_link("https://t.me/chan"), None);
        assert_eq!(post_id_from_link(""), None);
    }

    #[tokio::test]
    async fn test_latest_post_from_bridge() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("bridge", "TelegramBridge"))
            .and(query_param("username", "somechannel"))
            .and(query_param("format", "Json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    { "url": "https://t.me/somechannel/77", "content_html": POST_HTML },
                    { "url": "https://t.me/somechannel/76", "content_html": "" }
                ]
            })))
            .mount(&server)
            .await;

        let client = RssBridgeClient::new(&RssConfig::default());
        let domain = server.address().to_string();
        let post = client
            .latest_post("@somechannel", &domain)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(post.id(), Some(77));
        assert_eq!(post.media.len(), 4);
        assert!(post.text.ends_with("Source: https://t.me/somechannel/77"));
    }

    #[tokio::test]
    async fn test_empty_feed_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "items": [] })))
            .mount(&server)
            .await;

        let client = RssBridgeClient::new(&RssConfig::default());
        let post = client
            .latest_post("somechannel", &server.address().to_string())
            .await
            .unwrap();
        assert!(post.is_none());
    }

    #[tokio::test]
    async fn test_bridge_error_is_err() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = RssBridgeClient::new(&RssConfig::default());
        assert!(client
            .latest_post("somechannel", &server.address().to_string())
            .await
            .is_err());
    }
}
