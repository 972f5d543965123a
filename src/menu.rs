//! Settings menus: callback identifiers, keyboards and the replies the
//! configuration flow sends back.

use std::fmt;

use teloxide::utils::html;

use crate::store::{ChatKind, Feed, Settings};

/// What a thread button does for one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadAction {
    On,
    Off,
    Confirm,
    Reject,
}

impl ThreadAction {
    fn as_str(&self) -> &'static str {
        match self {
            ThreadAction::On => "on",
            ThreadAction::Off => "off",
            ThreadAction::Confirm => "confirm",
            ThreadAction::Reject => "reject",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "on" => Some(ThreadAction::On),
            "off" => Some(ThreadAction::Off),
            "confirm" => Some(ThreadAction::Confirm),
            "reject" => Some(ThreadAction::Reject),
            _ => None,
        }
    }
}

/// Every button the bot knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    Settings,
    ForwardMenu,
    ForwardChannel,
    ForwardDomain,
    ForwardOfficialDomain,
    ChatMenu,
    ChangeChat(ChatKind),
    ConfirmChat,
    RejectChat,
    Thread(Feed, ThreadAction),
    TwitchMenu,
    TwitchChannel,
    TwitchTokens,
    TwitchAlertText,
}

impl Callback {
    /// Parse a colon-separated callback id; unknown ids yield `None`.
    pub fn parse(data: &str) -> Option<Self> {
        let parts: Vec<&str> = data.split(':').collect();
        let callback = match parts.as_slice() {
            ["settings"] => Callback::Settings,
            ["forward"] => Callback::ForwardMenu,
            ["forward", "channel"] => Callback::ForwardChannel,
            ["forward", "rssbridge"] => Callback::ForwardDomain,
            ["forward", "rssbridge", "official"] => Callback::ForwardOfficialDomain,
            ["chatsettings"] => Callback::ChatMenu,
            ["chatsettings", "chat", "confirm"] => Callback::ConfirmChat,
            ["chatsettings", "chat", "reject"] => Callback::RejectChat,
            ["chatsettings", "chat", kind] => Callback::ChangeChat(ChatKind::parse(kind)?),
            ["chatsettings", thread, action] => {
                let feed = Feed::from_slug(thread.strip_prefix("thread")?)?;
                Callback::Thread(feed, ThreadAction::parse(action)?)
            }
            ["twitch"] => Callback::TwitchMenu,
            ["twitch", "channel"] => Callback::TwitchChannel,
            ["twitch", "tokens"] => Callback::TwitchTokens,
            ["twitch", "alerttext"] => Callback::TwitchAlertText,
            _ => return None,
        };
        Some(callback)
    }
}

impl fmt::Display for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Settings => f.write_str("settings"),
            Callback::ForwardMenu => f.write_str("forward"),
            Callback::ForwardChannel => f.write_str("forward:channel"),
            Callback::ForwardDomain => f.write_str("forward:rssbridge"),
            Callback::ForwardOfficialDomain => f.write_str("forward:rssbridge:official"),
            Callback::ChatMenu => f.write_str("chatsettings"),
            Callback::ChangeChat(kind) => write!(f, "chatsettings:chat:{}", kind.as_str()),
            Callback::ConfirmChat => f.write_str("chatsettings:chat:confirm"),
            Callback::RejectChat => f.write_str("chatsettings:chat:reject"),
            Callback::Thread(feed, action) => {
                write!(f, "chatsettings:thread{}:{}", feed.slug(), action.as_str())
            }
            Callback::TwitchMenu => f.write_str("twitch"),
            Callback::TwitchChannel => f.write_str("twitch:channel"),
            Callback::TwitchTokens => f.write_str("twitch:tokens"),
            Callback::TwitchAlertText => f.write_str("twitch:alerttext"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Button {
    Callback { text: String, data: String },
    Link { text: String, url: String },
}

impl Button {
    pub fn callback(text: impl Into<String>, callback: Callback) -> Self {
        Button::Callback {
            text: text.into(),
            data: callback.to_string(),
        }
    }

    pub fn link(text: impl Into<String>, url: impl Into<String>) -> Self {
        Button::Link {
            text: text.into(),
            url: url.into(),
        }
    }
}

pub type Keyboard = Vec<Vec<Button>>;

/// Where a reply should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTarget {
    /// The chat the command or button came from
    Here,
    /// Replace the text of the message holding the pressed button
    EditOrigin,
    /// The owner's private chat
    Owner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub target: ReplyTarget,
    pub text: String,
    pub html: bool,
    pub keyboard: Option<Keyboard>,
}

impl Reply {
    pub fn here(text: impl Into<String>) -> Self {
        Self {
            target: ReplyTarget::Here,
            text: text.into(),
            html: false,
            keyboard: None,
        }
    }

    pub fn owner(text: impl Into<String>) -> Self {
        Self {
            target: ReplyTarget::Owner,
            ..Self::here(text)
        }
    }

    pub fn edit(text: impl Into<String>) -> Self {
        Self {
            target: ReplyTarget::EditOrigin,
            ..Self::here(text)
        }
    }

    pub fn html(mut self) -> Self {
        self.html = true;
        self
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }
}

fn or_unset(value: Option<impl fmt::Display>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "not set".to_string())
}

/// First five characters followed by a fixed mask.
pub fn mask_secret(secret: Option<&str>) -> String {
    match secret {
        Some(s) => format!("{}{}", s.chars().take(5).collect::<String>(), "*".repeat(25)),
        None => "not set".to_string(),
    }
}

pub fn main_menu() -> (String, Keyboard) {
    (
        "Bot settings".to_string(),
        vec![
            vec![Button::callback("Post forwarding", Callback::ForwardMenu)],
            vec![
                Button::callback("Chat", Callback::ChatMenu),
                Button::callback("Twitch", Callback::TwitchMenu),
            ],
        ],
    )
}

pub fn forward_menu(settings: &Settings) -> (String, Keyboard) {
    let text = format!(
        "Post forwarding settings\n\nTracked channel: {}\nRSS-bridge address: {}",
        or_unset(settings.telegram_channel.as_deref().map(|c| format!("@{c}"))),
        or_unset(settings.domain.as_deref()),
    );
    let keyboard = vec![
        vec![
            Button::callback("Change channel", Callback::ForwardChannel),
            Button::callback("Change RSS-bridge address", Callback::ForwardDomain),
        ],
        vec![Button::callback("Back", Callback::Settings)],
    ];
    (text, keyboard)
}

pub fn chat_menu(settings: &Settings) -> (String, Keyboard) {
    let chat = match (settings.chat_id, settings.chat_kind) {
        (Some(id), Some(kind)) => format!("{} ({})", id, kind.as_str()),
        (Some(id), None) => id.to_string(),
        (None, _) => "not set".to_string(),
    };
    let text = format!(
        "Chat settings\n\nChat: {}\nStream alerts thread: {}\nPost forwarding thread: {}\nClips thread: {}",
        chat,
        or_unset(settings.thread_alerts),
        or_unset(settings.thread_news),
        or_unset(settings.thread_clips),
    );
    let thread_button = |label: &str, feed: Feed| {
        Button::callback(label, Callback::Thread(feed, ThreadAction::On))
    };
    let mut keyboard = vec![
        vec![
            thread_button("Alerts thread", Feed::Alerts),
            thread_button("Posts thread", Feed::News),
        ],
        vec![thread_button("Clips thread", Feed::Clips)],
    ];
    let off_row: Vec<Button> = Feed::ALL
        .into_iter()
        .filter(|feed| settings.thread(*feed).is_some())
        .map(|feed| {
            turn_off_button(feed, &format!("Turn off {}", feed.describe().to_lowercase()))
        })
        .collect();
    if !off_row.is_empty() {
        keyboard.push(off_row);
    }
    keyboard.push(vec![
        Button::callback("Change group", Callback::ChangeChat(ChatKind::Group)),
        Button::callback("Change channel", Callback::ChangeChat(ChatKind::Channel)),
    ]);
    keyboard.push(vec![Button::callback("Back", Callback::Settings)]);
    (text, keyboard)
}

/// Disables `feed`: clears its thread and stops its loop.
pub fn turn_off_button(feed: Feed, label: &str) -> Button {
    Button::callback(label, Callback::Thread(feed, ThreadAction::Off))
}

pub fn twitch_menu(settings: &Settings, alert_text: Option<&str>) -> (String, Keyboard) {
    let text = format!(
        "Twitch settings\n\nChannel: {}\nClient ID: {}\nClient secret: {}\n\nAlert text\n<i>{}</i>",
        or_unset(settings.twitch_username.as_deref().map(html::escape)),
        mask_secret(settings.client_id.as_deref()),
        mask_secret(settings.client_secret.as_deref()),
        alert_text.unwrap_or("No custom text"),
    );
    let keyboard = vec![
        vec![
            Button::callback("Change channel", Callback::TwitchChannel),
            Button::callback("Change tokens", Callback::TwitchTokens),
        ],
        vec![Button::callback("Change alert text", Callback::TwitchAlertText)],
        vec![Button::callback("Back", Callback::Settings)],
    ];
    (text, keyboard)
}

/// Confirm/reject pair for a captured thread or chat.
pub fn confirm_keyboard(confirm: Callback, reject: Callback, reject_label: &str) -> Keyboard {
    vec![
        vec![Button::callback("Confirm", confirm)],
        vec![Button::callback(reject_label, reject)],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_ids_round_trip() {
        let all = [
            Callback::Settings,
            Callback::ForwardMenu,
            Callback::ForwardChannel,
            Callback::ForwardDomain,
            Callback::ForwardOfficialDomain,
            Callback::ChatMenu,
            Callback::ChangeChat(ChatKind::Group),
            Callback::ChangeChat(ChatKind::Channel),
            Callback::ConfirmChat,
            Callback::RejectChat,
            Callback::Thread(Feed::News, ThreadAction::On),
            Callback::Thread(Feed::Alerts, ThreadAction::Off),
            Callback::Thread(Feed::Clips, ThreadAction::Confirm),
            Callback::Thread(Feed::News, ThreadAction::Reject),
            Callback::TwitchMenu,
            Callback::TwitchChannel,
            Callback::TwitchTokens,
            Callback::TwitchAlertText,
        ];
        for callback in all {
            assert_eq!(Callback::parse(&callback.to_string()), Some(callback));
        }
    }

    #[test]
    fn test_known_wire_ids() {
        assert_eq!(
            Callback::parse("chatsettings:threadnews:on"),
            Some(Callback::Thread(Feed::News, ThreadAction::On))
        );
        assert_eq!(Callback::parse("twitch:tokens"), Some(Callback::TwitchTokens));
        assert_eq!(Callback::parse("forward:rssbridge"), Some(Callback::ForwardDomain));
    }

    #[test]
    fn test_unknown_ids() {
        assert_eq!(Callback::parse("botupdate"), None);
        assert_eq!(Callback::parse("chatsettings:threadmemes:on"), None);
        assert_eq!(Callback::parse("chatsettings:threadnews:maybe"), None);
        assert_eq!(Callback::parse("chatsettings:chat:supergroup"), None);
        assert_eq!(Callback::parse(""), None);
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(
            mask_secret(Some("abcdefghij")),
            format!("abcde{}", "*".repeat(25))
        );
        assert_eq!(mask_secret(None), "not set");
    }

    #[test]
    fn test_chat_menu_shows_unset_threads() {
        let settings = Settings {
            chat_id: Some(-100),
            thread_news: Some(0),
            ..Settings::default()
        };
        let (text, keyboard) = chat_menu(&settings);
        assert!(text.contains("Chat: -100"));
        assert!(text.contains("Post forwarding thread: 0"));
        assert!(text.contains("Stream alerts thread: not set"));
        assert_eq!(keyboard.len(), 5);
        assert_eq!(
            keyboard[2],
            vec![Button::callback(
                "Turn off post forwarding",
                Callback::Thread(Feed::News, ThreadAction::Off)
            )]
        );
    }

    #[test]
    fn test_chat_menu_without_threads_has_no_off_buttons() {
        let settings = Settings {
            chat_id: Some(-100),
            ..Settings::default()
        };
        let (_, keyboard) = chat_menu(&settings);
        assert_eq!(keyboard.len(), 4);
        assert!(keyboard
            .iter()
            .flatten()
            .all(|b| !matches!(b, Button::Callback { data, .. } if data.ends_with(":off"))));
    }
}
