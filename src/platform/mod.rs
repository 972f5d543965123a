pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::sources::MediaItem;

/// Telegram caps media captions at this many characters.
pub const CAPTION_LIMIT: usize = 1024;
/// Telegram accepts at most this many items in one media group.
pub const MEDIA_GROUP_LIMIT: usize = 10;

/// A chat plus an optional forum thread. Thread `0` is the general thread
/// and is sent without a thread id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub chat_id: i64,
    pub thread_id: Option<i32>,
}

impl Destination {
    pub fn new(chat_id: i64, thread_id: i32) -> Self {
        Self {
            chat_id,
            thread_id: (thread_id > 0).then_some(thread_id),
        }
    }

    pub fn chat(chat_id: i64) -> Self {
        Self {
            chat_id,
            thread_id: None,
        }
    }
}

/// A URL button shown under a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkButton {
    pub text: String,
    pub url: String,
}

impl LinkButton {
    pub fn new(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            url: url.into(),
        }
    }
}

/// Outbound side of the feeds: everything is HTML-formatted.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(
        &self,
        to: Destination,
        text: &str,
        button: Option<LinkButton>,
    ) -> Result<()>;

    /// Send a media group with `caption` on the first item only.
    async fn send_media_group(
        &self,
        to: Destination,
        media: &[MediaItem],
        caption: Option<&str>,
    ) -> Result<()>;

    async fn send_document(&self, to: Destination, path: &Path) -> Result<()>;
}

/// Forward a post: a media group when there is media, plain text otherwise.
/// Captions over the Telegram limit go out as a separate message.
pub async fn send_post(
    notifier: &dyn Notifier,
    to: Destination,
    text: &str,
    media: &[MediaItem],
) -> Result<()> {
    if media.is_empty() {
        return notifier.send_text(to, text, None).await;
    }

    let media = &media[..media.len().min(MEDIA_GROUP_LIMIT)];
    if text.chars().count() <= CAPTION_LIMIT {
        notifier.send_media_group(to, media, Some(text)).await
    } else {
        notifier.send_media_group(to, media, None).await?;
        notifier.send_text(to, text, None).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Sent {
        Text {
            to: Destination,
            text: String,
            button: Option<LinkButton>,
        },
        Media {
            to: Destination,
            media: Vec<MediaItem>,
            caption: Option<String>,
        },
        Document {
            to: Destination,
        },
    }

    /// Records every outbound call; `fail` makes every call error.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<Sent>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingNotifier {
        pub async fn sent(&self) -> Vec<Sent> {
            self.sent.lock().await.clone()
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("send failed");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_text(
            &self,
            to: Destination,
            text: &str,
            button: Option<LinkButton>,
        ) -> Result<()> {
            self.check()?;
            self.sent.lock().await.push(Sent::Text {
                to,
                text: text.to_string(),
                button,
            });
            Ok(())
        }

        async fn send_media_group(
            &self,
            to: Destination,
            media: &[MediaItem],
            caption: Option<&str>,
        ) -> Result<()> {
            self.check()?;
            self.sent.lock().await.push(Sent::Media {
                to,
                media: media.to_vec(),
                caption: caption.map(str::to_string),
            });
            Ok(())
        }

        async fn send_document(&self, to: Destination, _path: &Path) -> Result<()> {
            self.check()?;
            self.sent.lock().await.push(Sent::Document { to });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingNotifier, Sent};
    use super::*;

    #[test]
    fn test_general_thread_has_no_thread_id() {
        assert_eq!(Destination::new(-100, 0).thread_id, None);
        assert_eq!(Destination::new(-100, 42).thread_id, Some(42));
    }

    #[tokio::test]
    async fn test_text_only_post() {
        let notifier = RecordingNotifier::default();
        send_post(&notifier, Destination::new(1, 5), "hello", &[])
            .await
            .unwrap();
        assert_eq!(
            notifier.sent().await,
            vec![Sent::Text {
                to: Destination::new(1, 5),
                text: "hello".into(),
                button: None
            }]
        );
    }

    #[tokio::test]
    async fn test_media_post_caption_on_group() {
        let notifier = RecordingNotifier::default();
        let media: Vec<MediaItem> = (0..12)
            .map(|i| MediaItem::photo(format!("https://cdn/{i}.jpg")))
            .collect();
        send_post(&notifier, Destination::chat(1), "caption", &media)
            .await
            .unwrap();

        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::Media { media, caption, .. } => {
                assert_eq!(media.len(), MEDIA_GROUP_LIMIT);
                assert_eq!(caption.as_deref(), Some("caption"));
            }
            other => panic!("unexpected send: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_long_caption_sent_separately() {
        let notifier = RecordingNotifier::default();
        let text = "x".repeat(CAPTION_LIMIT + 1);
        send_post(
            &notifier,
            Destination::chat(1),
            &text,
            &[MediaItem::video("https://cdn/v.mp4")],
        )
        .await
        .unwrap();

        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], Sent::Media { caption: None, .. }));
        assert!(matches!(&sent[1], Sent::Text { text: t, .. } if t.len() == CAPTION_LIMIT + 1));
    }
}
